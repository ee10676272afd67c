use crate::catalog_db::{map_db_error, u64_column, CatalogDB};
use ess_lib::{unix_timestamp, Edge, EdgeStatus, EssError, EssResult};
use log::{info, warn};
use rusqlite::{params, Row};

const EDGE_COLUMNS: &str = "edge_id, edge_name, edge_type, status, is_independent, continent, \
    country_name, region_code, city, longitude, latitude, total_space, used_space, \
    reserved_space, num_files, created_at, updated_at";

fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<Edge> {
    Ok(Edge {
        edge_id: row.get(0)?,
        edge_name: row.get(1)?,
        edge_type: row.get(2)?,
        status: row.get(3)?,
        is_independent: row.get(4)?,
        continent: row.get(5)?,
        country_name: row.get(6)?,
        region_code: row.get(7)?,
        city: row.get(8)?,
        longitude: row.get(9)?,
        latitude: row.get(10)?,
        total_space: u64_column(row, 11)?,
        used_space: u64_column(row, 12)?,
        reserved_space: u64_column(row, 13)?,
        num_files: u64_column(row, 14)?,
        created_at: u64_column(row, 15)?,
        updated_at: u64_column(row, 16)?,
    })
}

impl CatalogDB {
    /// Registers an edge. Fails with `AlreadyExists` when the name is taken.
    pub fn add_edge(&self, edge: &Edge) -> EssResult<i64> {
        if edge.edge_name.is_empty() {
            return Err(EssError::InvalidParam("edge name is empty".to_string()));
        }
        let now = unix_timestamp();
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO edges (edge_name, edge_type, status, is_independent, continent,
                country_name, region_code, city, longitude, latitude, total_space, used_space,
                reserved_space, num_files, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)",
            params![
                edge.edge_name,
                edge.edge_type,
                edge.status,
                edge.is_independent,
                edge.continent,
                edge.country_name,
                edge.region_code,
                edge.city,
                edge.longitude,
                edge.latitude,
                edge.total_space as i64,
                edge.used_space as i64,
                edge.reserved_space as i64,
                edge.num_files as i64,
                now as i64,
            ],
        )
        .map_err(|e| map_db_error(&format!("add edge {}", edge.edge_name), e))?;
        let edge_id = conn.last_insert_rowid();
        info!(
            "CatalogDB: edge registered: edge_name={}, edge_id={}",
            edge.edge_name, edge_id
        );
        Ok(edge_id)
    }

    pub fn get_edge(&self, edge_name: &str) -> EssResult<Edge> {
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!("SELECT {} FROM edges WHERE edge_name = ?1", EDGE_COLUMNS),
            params![edge_name],
            edge_from_row,
        )
        .map_err(|e| map_db_error(&format!("get edge {}", edge_name), e))
    }

    pub fn get_edge_by_id(&self, edge_id: i64) -> EssResult<Edge> {
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!("SELECT {} FROM edges WHERE edge_id = ?1", EDGE_COLUMNS),
            params![edge_id],
            edge_from_row,
        )
        .map_err(|e| map_db_error(&format!("get edge #{}", edge_id), e))
    }

    /// Overwrites the mutable fields of the edge named `edge.edge_name` and refreshes
    /// its heartbeat timestamp.
    pub fn update_edge(&self, edge: &Edge) -> EssResult<()> {
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "UPDATE edges SET edge_type = ?2, status = ?3, is_independent = ?4,
                    continent = ?5, country_name = ?6, region_code = ?7, city = ?8,
                    longitude = ?9, latitude = ?10, total_space = ?11, used_space = ?12,
                    reserved_space = ?13, num_files = ?14, updated_at = ?15
                 WHERE edge_name = ?1",
                params![
                    edge.edge_name,
                    edge.edge_type,
                    edge.status,
                    edge.is_independent,
                    edge.continent,
                    edge.country_name,
                    edge.region_code,
                    edge.city,
                    edge.longitude,
                    edge.latitude,
                    edge.total_space as i64,
                    edge.used_space as i64,
                    edge.reserved_space as i64,
                    edge.num_files as i64,
                    unix_timestamp() as i64,
                ],
            )
            .map_err(|e| map_db_error(&format!("update edge {}", edge.edge_name), e))?;
        if changed == 0 {
            return Err(EssError::NotFound(format!("edge {}", edge.edge_name)));
        }
        Ok(())
    }

    pub fn set_edge_status(&self, edge_name: &str, status: EdgeStatus) -> EssResult<()> {
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "UPDATE edges SET status = ?2 WHERE edge_name = ?1",
                params![edge_name, status],
            )
            .map_err(|e| map_db_error(&format!("set edge {} status", edge_name), e))?;
        if changed == 0 {
            return Err(EssError::NotFound(format!("edge {}", edge_name)));
        }
        Ok(())
    }

    pub fn delete_edge(&self, edge_name: &str) -> EssResult<()> {
        let conn = self.lock_conn()?;
        let changed = conn
            .execute("DELETE FROM edges WHERE edge_name = ?1", params![edge_name])
            .map_err(|e| map_db_error(&format!("delete edge {}", edge_name), e))?;
        if changed == 0 {
            return Err(EssError::NotFound(format!("edge {}", edge_name)));
        }
        Ok(())
    }

    pub fn list_edges(&self, status: Option<EdgeStatus>) -> EssResult<Vec<Edge>> {
        let conn = self.lock_conn()?;
        let map_err = |e| map_db_error("list edges", e);
        let edges = match status {
            Some(status) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM edges WHERE status = ?1 ORDER BY edge_id",
                        EDGE_COLUMNS
                    ))
                    .map_err(map_err)?;
                let rows = stmt
                    .query_map(params![status], edge_from_row)
                    .map_err(map_err)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)?
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!("SELECT {} FROM edges ORDER BY edge_id", EDGE_COLUMNS))
                    .map_err(map_err)?;
                let rows = stmt.query_map([], edge_from_row).map_err(map_err)?;
                rows.collect::<rusqlite::Result<Vec<_>>>().map_err(map_err)?
            }
        };
        Ok(edges)
    }

    /// Flags ACTIVE edges whose last heartbeat is older than `before` as LOSTHEARTBEAT.
    /// The heartbeat timestamp itself is left alone.
    pub fn mark_edges_stale_before(&self, before: u64) -> EssResult<usize> {
        let conn = self.lock_conn()?;
        let changed = conn
            .execute(
                "UPDATE edges SET status = ?1 WHERE status = ?2 AND updated_at < ?3",
                params![EdgeStatus::LostHeartbeat, EdgeStatus::Active, before as i64],
            )
            .map_err(|e| map_db_error("mark stale edges", e))?;
        if changed > 0 {
            warn!(
                "CatalogDB: edges lost heartbeat: count={}, before={}",
                changed, before
            );
        }
        Ok(changed)
    }

    pub fn mark_stale_edges(&self, heartbeat_timeout_secs: u64) -> EssResult<usize> {
        let before = unix_timestamp().saturating_sub(heartbeat_timeout_secs);
        self.mark_edges_stale_before(before)
    }
}
