use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: String,
    pub name: String,
    pub hostname: String,
    pub user: String,
    pub port: u16,
    /// Filesystem-safe namespace segment under the backup root.
    pub path: String,
    pub is_workstation: bool,
    pub failed_backups_count: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateHostRequest {
    pub name: String,
    pub hostname: String,
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub is_workstation: bool,
}

fn default_port() -> u16 {
    22
}

/// Lowercase, runs of non-alphanumerics collapsed to `-`, no leading/trailing `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c);
        } else {
            pending_dash = true;
        }
    }
    slug
}

const SELECT_HOST: &str = "SELECT h.*, \
    (SELECT COUNT(*) FROM backup_tasks t WHERE t.host_id = h.id AND t.status = 'failed') AS failed_backups_count \
    FROM hosts h";

fn row_to_host(row: &Row) -> rusqlite::Result<Host> {
    Ok(Host {
        id: row.get("id")?,
        name: row.get("name")?,
        hostname: row.get("hostname")?,
        user: row.get("ssh_user")?,
        port: row.get("port")?,
        path: row.get("path")?,
        is_workstation: row.get("is_workstation")?,
        failed_backups_count: row.get("failed_backups_count")?,
        created_at: row.get("created_at")?,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Host>> {
    let mut stmt = conn.prepare(&format!("{SELECT_HOST} ORDER BY h.created_at DESC"))?;
    let rows = stmt.query_map([], row_to_host)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<Host>> {
    let mut stmt = conn.prepare(&format!("{SELECT_HOST} WHERE h.id = ?"))?;
    Ok(stmt.query_row(params![id], row_to_host).optional()?)
}

pub fn create(conn: &Connection, data: &CreateHostRequest) -> anyhow::Result<Host> {
    let slug = slugify(&data.name);
    if slug.is_empty() {
        anyhow::bail!("host name {:?} yields an empty path", data.name);
    }
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO hosts (id, name, hostname, ssh_user, port, path, is_workstation, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![id, data.name, data.hostname, data.user, data.port, slug, data.is_workstation, now],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created host"))
}

/// Deleting a host cascades to its backup tasks, their hooks and error rows.
pub fn delete(conn: &Connection, id: &str) -> anyhow::Result<bool> {
    let changes = conn.execute("DELETE FROM hosts WHERE id = ?", params![id])?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Web"), "web");
        assert_eq!(slugify("  My DB Server #2 "), "my-db-server-2");
        assert_eq!(slugify("a--b__c"), "a-b-c");
        assert_eq!(slugify("---"), "");
        assert_eq!(slugify("Ünïcode Box"), "n-code-box");
    }
}
