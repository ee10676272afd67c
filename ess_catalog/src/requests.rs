use crate::catalog_db::{
    json_column, limit_sql, map_db_error, optional_json_column, to_json_text, u64_column,
    CatalogDB, WhereBuilder,
};
use ess_lib::{
    unix_timestamp, EssError, EssResult, Request, RequestErrors, RequestFilter, RequestStatus,
    RequestUpdate,
};
use log::{debug, info, warn};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, Row};

const REQUEST_COLUMNS: &str = "request_id, scope, name, data_type, granularity_type, \
    granularity_level, priority, edge_id, status, request_meta, processing_meta, errors, \
    created_at, updated_at";

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<Request> {
    let granularity_level: Option<i64> = row.get(5)?;
    Ok(Request {
        request_id: row.get(0)?,
        scope: row.get(1)?,
        name: row.get(2)?,
        data_type: row.get(3)?,
        granularity_type: row.get(4)?,
        granularity_level: granularity_level.map(|v| v.max(0) as u64),
        priority: row.get(6)?,
        edge_id: row.get(7)?,
        status: row.get(8)?,
        request_meta: json_column(row, 9)?,
        processing_meta: json_column(row, 10)?,
        errors: optional_json_column(row, 11)?,
        created_at: u64_column(row, 12)?,
        updated_at: u64_column(row, 13)?,
    })
}

fn request_filter_where(filter: &RequestFilter) -> WhereBuilder {
    let mut builder = WhereBuilder::default();
    builder
        .eq_opt_i64("edge_id", filter.edge_id)
        .eq_opt_text(
            "granularity_type",
            filter.granularity_type.map(|g| g.as_str()),
        )
        .eq_opt_text("scope", filter.scope.as_deref())
        .eq_opt_text("name", filter.name.as_deref());
    let statuses = filter.statuses.iter().map(|s| s.as_str()).collect::<Vec<_>>();
    builder.in_text("status", &statuses);
    builder
}

fn query_requests(conn: &Connection, filter: &RequestFilter) -> EssResult<Vec<Request>> {
    let builder = request_filter_where(filter);
    let sql = format!(
        "SELECT {} FROM requests{} ORDER BY priority DESC, request_id{}",
        REQUEST_COLUMNS,
        builder.sql(),
        limit_sql(filter.limit)
    );
    let map_err = |e| map_db_error("get requests", e);
    let mut stmt = conn.prepare(&sql).map_err(map_err)?;
    let rows = stmt
        .query_map(params_from_iter(builder.params.iter()), request_from_row)
        .map_err(map_err)?;
    let requests = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)?;
    Ok(requests)
}

/// `UPDATE requests SET ... WHERE request_id = ? [AND status = ?]`, returning rows changed.
fn apply_request_update(
    conn: &Connection,
    request_id: i64,
    update: &RequestUpdate,
    expected: Option<RequestStatus>,
) -> EssResult<usize> {
    let mut sets = vec!["updated_at = ?".to_string()];
    let mut values = vec![SqlValue::Integer(unix_timestamp() as i64)];
    if let Some(status) = update.status {
        sets.push("status = ?".to_string());
        values.push(SqlValue::Text(status.as_str().to_string()));
    }
    if let Some(edge_id) = update.edge_id {
        sets.push("edge_id = ?".to_string());
        values.push(SqlValue::Integer(edge_id));
    }
    if let Some(priority) = update.priority {
        sets.push("priority = ?".to_string());
        values.push(SqlValue::Integer(priority as i64));
    }
    if let Some(meta) = &update.processing_meta {
        sets.push("processing_meta = ?".to_string());
        values.push(SqlValue::Text(to_json_text(meta)?));
        sets.push("original_request_id = ?".to_string());
        values.push(match meta.original_request_id {
            Some(id) => SqlValue::Integer(id),
            None => SqlValue::Null,
        });
    }
    if let Some(errors) = &update.errors {
        sets.push("errors = ?".to_string());
        values.push(SqlValue::Text(to_json_text(errors)?));
    } else if update.clear_errors {
        sets.push("errors = NULL".to_string());
    }

    let mut builder = WhereBuilder::default();
    builder.eq("request_id", SqlValue::Integer(request_id));
    if let Some(expected) = expected {
        builder.eq("status", SqlValue::Text(expected.as_str().to_string()));
    }
    values.extend(builder.params.iter().cloned());

    let sql = format!("UPDATE requests SET {}{}", sets.join(", "), builder.sql());
    conn.execute(&sql, params_from_iter(values.iter()))
        .map_err(|e| map_db_error(&format!("update request #{}", request_id), e))
}

fn check_transition(request_id: i64, from: RequestStatus, update: &RequestUpdate) -> EssResult<RequestStatus> {
    let to = update.status.ok_or_else(|| {
        EssError::InvalidParam(format!(
            "transition of request #{} needs a target status",
            request_id
        ))
    })?;
    if !from.can_transition_to(to) {
        return Err(EssError::InvalidStateTransition(format!(
            "request #{}: {} -> {}",
            request_id, from, to
        )));
    }
    Ok(to)
}

impl CatalogDB {
    /// Inserts a request as given (status included). A request shadowing a remote one
    /// fails with `AlreadyExists` if that remote id is already mirrored here.
    pub fn add_request(&self, request: &Request) -> EssResult<i64> {
        let request_meta = to_json_text(&request.request_meta)?;
        let processing_meta = to_json_text(&request.processing_meta)?;
        let errors = match &request.errors {
            Some(errors) => Some(to_json_text(errors)?),
            None => None,
        };
        let now = unix_timestamp();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO requests (scope, name, data_type, granularity_type, granularity_level,
                priority, edge_id, status, request_meta, processing_meta, errors,
                original_request_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                request.scope,
                request.name,
                request.data_type,
                request.granularity_type,
                request.granularity_level.map(|v| v as i64),
                request.priority,
                request.edge_id,
                request.status,
                request_meta,
                processing_meta,
                errors,
                request.processing_meta.original_request_id,
                now as i64,
            ],
        )
        .map_err(|e| map_db_error(&format!("add request {}:{}", request.scope, request.name), e))?;
        let request_id = conn.last_insert_rowid();
        info!(
            "CatalogDB: request added: request_id={}, scope={}, name={}, granularity={}, status={}",
            request_id, request.scope, request.name, request.granularity_type, request.status
        );
        Ok(request_id)
    }

    pub fn get_request(&self, request_id: i64) -> EssResult<Request> {
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!("SELECT {} FROM requests WHERE request_id = ?1", REQUEST_COLUMNS),
            params![request_id],
            request_from_row,
        )
        .map_err(|e| map_db_error(&format!("get request #{}", request_id), e))
    }

    /// The local request mirroring a remote (head) request id.
    pub fn get_request_by_original(&self, original_request_id: i64) -> EssResult<Request> {
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM requests WHERE original_request_id = ?1",
                REQUEST_COLUMNS
            ),
            params![original_request_id],
            request_from_row,
        )
        .map_err(|e| {
            map_db_error(
                &format!("get request by original #{}", original_request_id),
                e,
            )
        })
    }

    pub fn get_requests(&self, filter: &RequestFilter) -> EssResult<Vec<Request>> {
        let conn = self.lock_conn()?;
        query_requests(&conn, filter)
    }

    pub fn get_requests_by_edge(
        &self,
        edge_id: i64,
        statuses: &[RequestStatus],
    ) -> EssResult<Vec<Request>> {
        let filter = RequestFilter {
            edge_id: Some(edge_id),
            statuses: statuses.to_vec(),
            ..Default::default()
        };
        self.get_requests(&filter)
    }

    /// Unconditional update for administrative use; workflow code goes through
    /// [`CatalogDB::transition_request`].
    pub fn update_request(&self, request_id: i64, update: &RequestUpdate) -> EssResult<()> {
        let conn = self.lock_conn()?;
        let changed = apply_request_update(&conn, request_id, update, None)?;
        if changed == 0 {
            return Err(EssError::NotFound(format!("request #{}", request_id)));
        }
        Ok(())
    }

    /// Compare-and-swap on status: applies `update` only while the request is still in
    /// `from`. `Ok(false)` means another worker moved it first.
    pub fn transition_request(
        &self,
        request_id: i64,
        from: RequestStatus,
        update: &RequestUpdate,
    ) -> EssResult<bool> {
        let to = check_transition(request_id, from, update)?;
        let conn = self.lock_conn()?;
        let changed = apply_request_update(&conn, request_id, update, Some(from))?;
        if changed == 0 {
            debug!(
                "CatalogDB: request transition lost: request_id={}, {} -> {}",
                request_id, from, to
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Claims up to `filter.limit` requests in `from`, moving each to `to` in one transaction.
    /// Returns only the requests this call won, with their new status.
    pub fn claim_requests(
        &self,
        filter: &RequestFilter,
        from: RequestStatus,
        to: RequestStatus,
    ) -> EssResult<Vec<Request>> {
        let update = RequestUpdate::status(to);
        check_transition(0, from, &update)?;
        let mut filter = filter.clone();
        filter.statuses = vec![from];

        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| map_db_error("claim requests: begin", e))?;
        let candidates = query_requests(&tx, &filter)?;
        let mut claimed = Vec::with_capacity(candidates.len());
        for mut request in candidates {
            if apply_request_update(&tx, request.request_id, &update, Some(from))? == 1 {
                request.status = to;
                claimed.push(request);
            }
        }
        tx.commit()
            .map_err(|e| map_db_error("claim requests: commit", e))?;
        if !claimed.is_empty() {
            info!(
                "CatalogDB: requests claimed: {} -> {}, ids={:?}",
                from,
                to,
                claimed.iter().map(|r| r.request_id).collect::<Vec<_>>()
            );
        }
        Ok(claimed)
    }

    pub fn delete_request(&self, request_id: i64) -> EssResult<()> {
        let conn = self.lock_conn()?;
        let changed = conn
            .execute("DELETE FROM requests WHERE request_id = ?1", params![request_id])
            .map_err(|e| map_db_error(&format!("delete request #{}", request_id), e))?;
        if changed == 0 {
            return Err(EssError::NotFound(format!("request #{}", request_id)));
        }
        Ok(())
    }

    /// Returns requests stuck in the claimed status `from` since `updated_before` (or earlier)
    /// to `to`, recording `message` as their error. Used to recover claims whose owner
    /// died; the workflow edge check is not applied.
    pub fn requeue_stale_requests(
        &self,
        from: RequestStatus,
        to: RequestStatus,
        edge_id: Option<i64>,
        updated_before: u64,
        message: &str,
    ) -> EssResult<usize> {
        let errors = to_json_text(&RequestErrors::new(message))?;
        let mut sql = "UPDATE requests SET status = ?1, errors = ?2, updated_at = ?3
             WHERE status = ?4 AND updated_at <= ?5"
            .to_string();
        let mut values = vec![
            SqlValue::Text(to.as_str().to_string()),
            SqlValue::Text(errors),
            SqlValue::Integer(unix_timestamp() as i64),
            SqlValue::Text(from.as_str().to_string()),
            SqlValue::Integer(updated_before as i64),
        ];
        if let Some(edge_id) = edge_id {
            sql.push_str(" AND edge_id = ?6");
            values.push(SqlValue::Integer(edge_id));
        }
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(&sql, params_from_iter(values.iter()))
            .map_err(|e| map_db_error("requeue stale requests", e))?;
        if changed > 0 {
            warn!(
                "CatalogDB: stale requests requeued: {} -> {}, count={}, edge_id={:?}",
                from, to, changed, edge_id
            );
        }
        Ok(changed)
    }

    /// Administrative reset of a request back to NEW: clears errors and placement and
    /// counts the retry in `processing_meta.retries`.
    pub fn reset_request(&self, request_id: i64) -> EssResult<Request> {
        let mut request = self.get_request(request_id)?;
        let mut meta = request.processing_meta.clone();
        meta.retries += 1;
        let meta_text = to_json_text(&meta)?;
        {
            let conn = self.lock_conn()?;
            let changed = conn
                .execute(
                    "UPDATE requests SET status = ?2, edge_id = NULL, errors = NULL,
                        processing_meta = ?3, updated_at = ?4
                     WHERE request_id = ?1 AND status = ?5",
                    params![
                        request_id,
                        RequestStatus::New,
                        meta_text,
                        unix_timestamp() as i64,
                        request.status,
                    ],
                )
                .map_err(|e| map_db_error(&format!("reset request #{}", request_id), e))?;
            if changed == 0 {
                return Err(EssError::InvalidStateTransition(format!(
                    "request #{} changed while resetting",
                    request_id
                )));
            }
        }
        warn!(
            "CatalogDB: request reset to NEW: request_id={}, previous_status={}, retries={}",
            request_id, request.status, meta.retries
        );
        request.status = RequestStatus::New;
        request.edge_id = None;
        request.errors = None;
        request.processing_meta = meta;
        Ok(request)
    }
}
