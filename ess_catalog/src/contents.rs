use crate::catalog_db::{
    json_column, limit_sql, map_db_error, to_json_text, u64_column, CatalogDB, WhereBuilder,
};
use ess_lib::{
    unix_timestamp, Content, ContentFilter, ContentStatistic, ContentStatus, ContentType,
    ContentUpdate, EssError, EssResult,
};
use log::{debug, info};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Row};

const CONTENT_COLUMNS: &str = "content_id, coll_id, scope, name, min_id, max_id, content_type, \
    status, priority, edge_id, num_success, num_failure, last_failed_at, pfn_size, pfn, \
    object_metadata, created_at, updated_at";

const INSERT_CONTENT: &str = "INSERT INTO contents (coll_id, scope, name, min_id, max_id,
        content_type, status, priority, edge_id, num_success, num_failure, last_failed_at,
        pfn_size, pfn, object_metadata, created_at, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?16)";

/// Statuses a re-run of pre-cache may overwrite in place.
const REFRESHABLE_STATUSES: &str = "('NEW', 'UNAVAILABLE', 'BAD')";

fn content_from_row(row: &Row<'_>) -> rusqlite::Result<Content> {
    let last_failed_at: Option<i64> = row.get(12)?;
    Ok(Content {
        content_id: row.get(0)?,
        coll_id: row.get(1)?,
        scope: row.get(2)?,
        name: row.get(3)?,
        min_id: u64_column(row, 4)?,
        max_id: u64_column(row, 5)?,
        content_type: row.get(6)?,
        status: row.get(7)?,
        priority: row.get(8)?,
        edge_id: row.get(9)?,
        num_success: row.get(10)?,
        num_failure: row.get(11)?,
        last_failed_at: last_failed_at.map(|v| v.max(0) as u64),
        pfn_size: u64_column(row, 13)?,
        pfn: row.get(14)?,
        object_metadata: json_column(row, 15)?,
        created_at: u64_column(row, 16)?,
        updated_at: u64_column(row, 17)?,
    })
}

fn content_filter_where(filter: &ContentFilter) -> WhereBuilder {
    let mut builder = WhereBuilder::default();
    builder
        .eq_opt_i64("coll_id", filter.coll_id)
        .eq_opt_i64("edge_id", filter.edge_id)
        .eq_opt_text("scope", filter.scope.as_deref())
        .eq_opt_text("name", filter.name.as_deref())
        .eq_opt_text("content_type", filter.content_type.map(|t| t.as_str()));
    let statuses = filter.statuses.iter().map(|s| s.as_str()).collect::<Vec<_>>();
    builder.in_text("status", &statuses);
    builder
}

fn insert_content_row(conn: &Connection, sql: &str, content: &Content, now: u64) -> EssResult<usize> {
    let metadata = to_json_text(&content.object_metadata)?;
    conn.execute(
        sql,
        params![
            content.coll_id,
            content.scope,
            content.name,
            content.min_id as i64,
            content.max_id as i64,
            content.content_type,
            content.status,
            content.priority,
            content.edge_id,
            content.num_success,
            content.num_failure,
            content.last_failed_at.map(|v| v as i64),
            content.pfn_size as i64,
            content.pfn,
            metadata,
            now as i64,
        ],
    )
    .map_err(|e| {
        map_db_error(
            &format!(
                "add content {}:{} [{}, {}] {}",
                content.scope, content.name, content.min_id, content.max_id, content.content_type
            ),
            e,
        )
    })
}

fn query_contents(conn: &Connection, filter: &ContentFilter) -> EssResult<Vec<Content>> {
    let builder = content_filter_where(filter);
    let sql = format!(
        "SELECT {} FROM contents{} ORDER BY priority DESC, content_id{}",
        CONTENT_COLUMNS,
        builder.sql(),
        limit_sql(filter.limit)
    );
    let map_err = |e| map_db_error("get contents", e);
    let mut stmt = conn.prepare(&sql).map_err(map_err)?;
    let rows = stmt
        .query_map(params_from_iter(builder.params.iter()), content_from_row)
        .map_err(map_err)?;
    let contents = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)?;
    Ok(contents)
}

fn apply_content_update(
    conn: &Connection,
    update: &ContentUpdate,
    expected: Option<ContentStatus>,
    now: u64,
) -> EssResult<usize> {
    let mut sets = vec!["updated_at = ?".to_string()];
    let mut values = vec![SqlValue::Integer(now as i64)];
    if let Some(status) = update.status {
        sets.push("status = ?".to_string());
        values.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(pfn) = &update.pfn {
        sets.push("pfn = ?".to_string());
        values.push(SqlValue::Text(pfn.clone()));
    }
    if let Some(pfn_size) = update.pfn_size {
        sets.push("pfn_size = ?".to_string());
        values.push(SqlValue::Integer(pfn_size as i64));
    }
    if let Some(priority) = update.priority {
        sets.push("priority = ?".to_string());
        values.push(SqlValue::Integer(priority as i64));
    }
    if let Some(metadata) = &update.object_metadata {
        sets.push("object_metadata = ?".to_string());
        values.push(SqlValue::Text(to_json_text(metadata)?));
    }
    if update.add_success > 0 {
        sets.push("num_success = num_success + ?".to_string());
        values.push(SqlValue::Integer(update.add_success as i64));
    }
    if update.add_failure > 0 {
        sets.push("num_failure = num_failure + ?".to_string());
        values.push(SqlValue::Integer(update.add_failure as i64));
    }
    if let Some(at) = update.last_failed_at {
        sets.push("last_failed_at = ?".to_string());
        values.push(SqlValue::Integer(at as i64));
    }

    let mut builder = WhereBuilder::default();
    builder.eq("content_id", SqlValue::Integer(update.content_id));
    if let Some(expected) = expected {
        builder.eq("status", SqlValue::Text(expected.as_str().to_string()));
    }
    values.extend(builder.params.iter().cloned());

    let sql = format!("UPDATE contents SET {}{}", sets.join(", "), builder.sql());
    conn.execute(&sql, params_from_iter(values.iter()))
        .map_err(|e| map_db_error(&format!("update content #{}", update.content_id), e))
}

impl CatalogDB {
    /// Inserts one content row. Fails with `AlreadyExists` on the unique key.
    pub fn add_content(&self, content: &Content) -> EssResult<i64> {
        let conn = self.lock_conn()?;
        insert_content_row(&conn, INSERT_CONTENT, content, unix_timestamp())?;
        Ok(conn.last_insert_rowid())
    }

    /// Batch insert in one transaction; rows already present are skipped.
    /// Returns the number of rows actually inserted.
    pub fn add_contents(&self, contents: &[Content]) -> EssResult<usize> {
        if contents.is_empty() {
            return Ok(0);
        }
        let now = unix_timestamp();
        let sql = format!("{} ON CONFLICT DO NOTHING", INSERT_CONTENT);
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| map_db_error("add contents: begin", e))?;
        let mut inserted = 0;
        for content in contents {
            inserted += insert_content_row(&tx, &sql, content, now)?;
        }
        tx.commit()
            .map_err(|e| map_db_error("add contents: commit", e))?;
        debug!(
            "CatalogDB: add contents: requested={}, inserted={}",
            contents.len(),
            inserted
        );
        Ok(inserted)
    }

    /// Batch insert where an existing row in NEW/UNAVAILABLE/BAD is refreshed in place
    /// (status, location, size, metadata). Rows further along the workflow are kept.
    pub fn upsert_contents(&self, contents: &[Content]) -> EssResult<usize> {
        if contents.is_empty() {
            return Ok(0);
        }
        let now = unix_timestamp();
        let sql = format!(
            "{} ON CONFLICT(scope, name, coll_id, content_type, min_id, max_id, edge_id)
             DO UPDATE SET status = excluded.status, pfn = excluded.pfn,
                pfn_size = excluded.pfn_size, object_metadata = excluded.object_metadata,
                priority = excluded.priority, updated_at = excluded.updated_at
             WHERE contents.status IN {}",
            INSERT_CONTENT, REFRESHABLE_STATUSES
        );
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| map_db_error("upsert contents: begin", e))?;
        let mut touched = 0;
        for content in contents {
            touched += insert_content_row(&tx, &sql, content, now)?;
        }
        tx.commit()
            .map_err(|e| map_db_error("upsert contents: commit", e))?;
        Ok(touched)
    }

    pub fn get_content(&self, content_id: i64) -> EssResult<Content> {
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!("SELECT {} FROM contents WHERE content_id = ?1", CONTENT_COLUMNS),
            params![content_id],
            content_from_row,
        )
        .map_err(|e| map_db_error(&format!("get content #{}", content_id), e))
    }

    /// Exact lookup on the content identity (edge, scope, name, type, range).
    pub fn get_content_by_range(
        &self,
        edge_id: i64,
        scope: &str,
        name: &str,
        content_type: ContentType,
        min_id: u64,
        max_id: u64,
    ) -> EssResult<Content> {
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM contents WHERE edge_id = ?1 AND scope = ?2 AND name = ?3
                    AND content_type = ?4 AND min_id = ?5 AND max_id = ?6",
                CONTENT_COLUMNS
            ),
            params![edge_id, scope, name, content_type, min_id as i64, max_id as i64],
            content_from_row,
        )
        .map_err(|e| {
            map_db_error(
                &format!("get content {}:{} [{}, {}]", scope, name, min_id, max_id),
                e,
            )
        })
    }

    /// The smallest stored range at `edge_id` that covers `[min_id, max_id]`.
    pub fn get_content_best_match(
        &self,
        edge_id: i64,
        scope: &str,
        name: &str,
        min_id: u64,
        max_id: u64,
        status: Option<ContentStatus>,
    ) -> EssResult<Content> {
        let mut builder = WhereBuilder::default();
        builder
            .eq("edge_id", SqlValue::Integer(edge_id))
            .eq("scope", SqlValue::Text(scope.to_string()))
            .eq("name", SqlValue::Text(name.to_string()))
            .raw("min_id <= ?", SqlValue::Integer(min_id as i64))
            .raw("max_id >= ?", SqlValue::Integer(max_id as i64))
            .eq_opt_text("status", status.map(|s| s.as_str()));
        let sql = format!(
            "SELECT {} FROM contents{} ORDER BY (max_id - min_id), content_id LIMIT 1",
            CONTENT_COLUMNS,
            builder.sql()
        );
        let conn = self.lock_conn()?;
        conn.query_row(&sql, params_from_iter(builder.params.iter()), content_from_row)
            .map_err(|e| {
                map_db_error(
                    &format!("best match {}:{} [{}, {}]", scope, name, min_id, max_id),
                    e,
                )
            })
    }

    pub fn get_contents(&self, filter: &ContentFilter) -> EssResult<Vec<Content>> {
        let conn = self.lock_conn()?;
        query_contents(&conn, filter)
    }

    pub fn get_contents_by_edge(&self, edge_id: i64, filter: &ContentFilter) -> EssResult<Vec<Content>> {
        let mut filter = filter.clone();
        filter.edge_id = Some(edge_id);
        self.get_contents(&filter)
    }

    pub fn count_contents(&self, filter: &ContentFilter) -> EssResult<u64> {
        let builder = content_filter_where(filter);
        let conn = self.lock_conn()?;
        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM contents{}", builder.sql()),
                params_from_iter(builder.params.iter()),
                |row| row.get(0),
            )
            .map_err(|e| map_db_error("count contents", e))?;
        Ok(count.max(0) as u64)
    }

    /// Row counts grouped by (edge_id, coll_id, content_type, status).
    pub fn get_contents_statistics(&self, filter: &ContentFilter) -> EssResult<Vec<ContentStatistic>> {
        let builder = content_filter_where(filter);
        let sql = format!(
            "SELECT edge_id, coll_id, content_type, status, COUNT(*) FROM contents{}
             GROUP BY edge_id, coll_id, content_type, status
             ORDER BY edge_id, coll_id, content_type, status",
            builder.sql()
        );
        let conn = self.lock_conn()?;
        let map_err = |e| map_db_error("get contents statistics", e);
        let mut stmt = conn.prepare(&sql).map_err(map_err)?;
        let rows = stmt
            .query_map(params_from_iter(builder.params.iter()), |row| {
                Ok(ContentStatistic {
                    edge_id: row.get(0)?,
                    coll_id: row.get(1)?,
                    content_type: row.get(2)?,
                    status: row.get(3)?,
                    count: u64_column(row, 4)?,
                })
            })
            .map_err(map_err)?;
        let stats = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)?;
        Ok(stats)
    }

    /// Applies each update in one transaction. With `expected`, only rows still in that
    /// status change, and a requested status must be a valid successor of it.
    /// Returns how many rows changed; rows skipped by the status guard are not errors.
    pub fn update_contents_by_id(
        &self,
        updates: &[ContentUpdate],
        expected: Option<ContentStatus>,
    ) -> EssResult<usize> {
        if let Some(expected) = expected {
            for update in updates {
                if let Some(next) = update.status {
                    if next != expected && !expected.can_transition_to(next) {
                        return Err(EssError::InvalidStateTransition(format!(
                            "content #{}: {} -> {}",
                            update.content_id, expected, next
                        )));
                    }
                }
            }
        }
        if updates.is_empty() {
            return Ok(0);
        }

        let now = unix_timestamp();
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| map_db_error("update contents: begin", e))?;
        let mut changed = 0;
        for update in updates {
            changed += apply_content_update(&tx, update, expected, now)?;
        }
        tx.commit()
            .map_err(|e| map_db_error("update contents: commit", e))?;
        Ok(changed)
    }

    /// Selects rows matching `filter` in status `from` and moves them to `to`.
    /// Only rows that were still in `from` are returned, already carrying `to`.
    pub fn claim_contents(
        &self,
        filter: &ContentFilter,
        from: ContentStatus,
        to: ContentStatus,
    ) -> EssResult<Vec<Content>> {
        if !from.can_transition_to(to) {
            return Err(EssError::InvalidStateTransition(format!(
                "content claim {} -> {}",
                from, to
            )));
        }
        let mut filter = filter.clone();
        filter.statuses = vec![from];

        let now = unix_timestamp();
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| map_db_error("claim contents: begin", e))?;
        let candidates = query_contents(&tx, &filter)?;
        let mut claimed = Vec::with_capacity(candidates.len());
        for mut content in candidates {
            let changed = apply_content_update(
                &tx,
                &ContentUpdate::new(content.content_id).status(to),
                Some(from),
                now,
            )?;
            if changed == 1 {
                content.status = to;
                content.updated_at = now;
                claimed.push(content);
            }
        }
        tx.commit()
            .map_err(|e| map_db_error("claim contents: commit", e))?;
        if !claimed.is_empty() {
            info!(
                "CatalogDB: contents claimed: {} -> {}, count={}",
                from,
                to,
                claimed.len()
            );
        }
        Ok(claimed)
    }

    pub fn delete_content(&self, content_id: i64) -> EssResult<()> {
        let conn = self.lock_conn()?;
        let changed = conn
            .execute("DELETE FROM contents WHERE content_id = ?1", params![content_id])
            .map_err(|e| map_db_error(&format!("delete content #{}", content_id), e))?;
        if changed == 0 {
            return Err(EssError::NotFound(format!("content #{}", content_id)));
        }
        Ok(())
    }
}
