use crate::catalog_db::{json_column, map_db_error, to_json_text, u64_column, CatalogDB};
use ess_lib::{unix_timestamp, Collection, CollectionReplica, EssError, EssResult};
use log::info;
use rusqlite::{params, Row};

const COLLECTION_COLUMNS: &str = "coll_id, scope, name, collection_type, coll_size, \
    global_status, total_files, num_replicas, coll_metadata, created_at, updated_at";

const REPLICA_COLUMNS: &str = "coll_id, edge_id, status, transferring_files, replicated_files, \
    num_active_requests, retries, created_at, updated_at";

fn collection_from_row(row: &Row<'_>) -> rusqlite::Result<Collection> {
    Ok(Collection {
        coll_id: row.get(0)?,
        scope: row.get(1)?,
        name: row.get(2)?,
        collection_type: row.get(3)?,
        coll_size: u64_column(row, 4)?,
        global_status: row.get(5)?,
        total_files: u64_column(row, 6)?,
        num_replicas: row.get(7)?,
        coll_metadata: json_column(row, 8)?,
        created_at: u64_column(row, 9)?,
        updated_at: u64_column(row, 10)?,
    })
}

fn replica_from_row(row: &Row<'_>) -> rusqlite::Result<CollectionReplica> {
    Ok(CollectionReplica {
        coll_id: row.get(0)?,
        edge_id: row.get(1)?,
        status: row.get(2)?,
        transferring_files: u64_column(row, 3)?,
        replicated_files: u64_column(row, 4)?,
        num_active_requests: row.get(5)?,
        retries: row.get(6)?,
        created_at: u64_column(row, 7)?,
        updated_at: u64_column(row, 8)?,
    })
}

impl CatalogDB {
    pub fn add_collection(&self, coll: &Collection) -> EssResult<i64> {
        let now = unix_timestamp();
        let metadata = to_json_text(&coll.coll_metadata)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO collections (scope, name, collection_type, coll_size, global_status,
                total_files, num_replicas, coll_metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
            params![
                coll.scope,
                coll.name,
                coll.collection_type,
                coll.coll_size as i64,
                coll.global_status,
                coll.total_files as i64,
                coll.num_replicas,
                metadata,
                now as i64,
            ],
        )
        .map_err(|e| map_db_error(&format!("add collection {}:{}", coll.scope, coll.name), e))?;
        let coll_id = conn.last_insert_rowid();
        info!(
            "CatalogDB: collection added: scope={}, name={}, coll_id={}, size={}",
            coll.scope, coll.name, coll_id, coll.coll_size
        );
        Ok(coll_id)
    }

    pub fn get_collection(&self, scope: &str, name: &str) -> EssResult<Collection> {
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM collections WHERE scope = ?1 AND name = ?2",
                COLLECTION_COLUMNS
            ),
            params![scope, name],
            collection_from_row,
        )
        .map_err(|e| map_db_error(&format!("get collection {}:{}", scope, name), e))
    }

    pub fn get_collection_by_id(&self, coll_id: i64) -> EssResult<Collection> {
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!("SELECT {} FROM collections WHERE coll_id = ?1", COLLECTION_COLUMNS),
            params![coll_id],
            collection_from_row,
        )
        .map_err(|e| map_db_error(&format!("get collection #{}", coll_id), e))
    }

    /// Writes every mutable attribute; scope and name never change.
    pub fn update_collection(&self, coll: &Collection) -> EssResult<()> {
        let metadata = to_json_text(&coll.coll_metadata)?;
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "UPDATE collections SET collection_type = ?2, coll_size = ?3,
                    global_status = ?4, total_files = ?5, num_replicas = ?6,
                    coll_metadata = ?7, updated_at = ?8
                 WHERE coll_id = ?1",
                params![
                    coll.coll_id,
                    coll.collection_type,
                    coll.coll_size as i64,
                    coll.global_status,
                    coll.total_files as i64,
                    coll.num_replicas,
                    metadata,
                    unix_timestamp() as i64,
                ],
            )
            .map_err(|e| map_db_error(&format!("update collection #{}", coll.coll_id), e))?;
        if changed == 0 {
            return Err(EssError::NotFound(format!("collection #{}", coll.coll_id)));
        }
        Ok(())
    }

    pub fn delete_collection(&self, coll_id: i64) -> EssResult<()> {
        let conn = self.lock_conn()?;
        let changed = conn
            .execute("DELETE FROM collections WHERE coll_id = ?1", params![coll_id])
            .map_err(|e| map_db_error(&format!("delete collection #{}", coll_id), e))?;
        if changed == 0 {
            return Err(EssError::NotFound(format!("collection #{}", coll_id)));
        }
        Ok(())
    }

    pub fn add_collection_replica(&self, replica: &CollectionReplica) -> EssResult<()> {
        let now = unix_timestamp();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO collection_replicas (coll_id, edge_id, status, transferring_files,
                replicated_files, num_active_requests, retries, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                replica.coll_id,
                replica.edge_id,
                replica.status,
                replica.transferring_files as i64,
                replica.replicated_files as i64,
                replica.num_active_requests,
                replica.retries,
                now as i64,
            ],
        )
        .map_err(|e| {
            map_db_error(
                &format!("add replica coll={} edge={}", replica.coll_id, replica.edge_id),
                e,
            )
        })?;
        Ok(())
    }

    pub fn get_collection_replica(&self, coll_id: i64, edge_id: i64) -> EssResult<CollectionReplica> {
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM collection_replicas WHERE coll_id = ?1 AND edge_id = ?2",
                REPLICA_COLUMNS
            ),
            params![coll_id, edge_id],
            replica_from_row,
        )
        .map_err(|e| map_db_error(&format!("get replica coll={} edge={}", coll_id, edge_id), e))
    }

    pub fn list_collection_replicas(&self, coll_id: i64) -> EssResult<Vec<CollectionReplica>> {
        let conn = self.lock_conn()?;
        let map_err = |e| map_db_error("list replicas", e);
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM collection_replicas WHERE coll_id = ?1 ORDER BY edge_id",
                REPLICA_COLUMNS
            ))
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![coll_id], replica_from_row)
            .map_err(map_err)?;
        let replicas = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)?;
        Ok(replicas)
    }

    pub fn update_collection_replica(&self, replica: &CollectionReplica) -> EssResult<()> {
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "UPDATE collection_replicas SET status = ?3, transferring_files = ?4,
                    replicated_files = ?5, num_active_requests = ?6, retries = ?7,
                    updated_at = ?8
                 WHERE coll_id = ?1 AND edge_id = ?2",
                params![
                    replica.coll_id,
                    replica.edge_id,
                    replica.status,
                    replica.transferring_files as i64,
                    replica.replicated_files as i64,
                    replica.num_active_requests,
                    replica.retries,
                    unix_timestamp() as i64,
                ],
            )
            .map_err(|e| map_db_error("update replica", e))?;
        if changed == 0 {
            return Err(EssError::NotFound(format!(
                "replica coll={} edge={}",
                replica.coll_id, replica.edge_id
            )));
        }
        Ok(())
    }

    /// Update the (coll, edge) replica row, creating it on first use.
    pub fn upsert_collection_replica(&self, replica: &CollectionReplica) -> EssResult<()> {
        match self.update_collection_replica(replica) {
            Err(e) if e.is_not_found() => match self.add_collection_replica(replica) {
                Err(e) if e.is_duplicate() => self.update_collection_replica(replica),
                other => other,
            },
            other => other,
        }
    }

    pub fn delete_collection_replica(&self, coll_id: i64, edge_id: i64) -> EssResult<()> {
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "DELETE FROM collection_replicas WHERE coll_id = ?1 AND edge_id = ?2",
                params![coll_id, edge_id],
            )
            .map_err(|e| map_db_error("delete replica", e))?;
        if changed == 0 {
            return Err(EssError::NotFound(format!(
                "replica coll={} edge={}",
                coll_id, edge_id
            )));
        }
        Ok(())
    }
}
