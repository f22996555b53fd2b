//! Database schema for the PostgreSQL scene store.
//!
//! Child tables reference `scenes` with `ON DELETE CASCADE` so scene
//! deletion removes artifacts, metrics and audit entries in one statement.

/// SQL schema for the scenes table.
pub const CREATE_SCENES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS scenes (
    id UUID PRIMARY KEY,
    source_uri TEXT NOT NULL,
    crs VARCHAR(64) NOT NULL,
    sensor_meta JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for the artifacts table.
pub const CREATE_ARTIFACTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS artifacts (
    id UUID PRIMARY KEY,
    scene_id UUID NOT NULL REFERENCES scenes(id) ON DELETE CASCADE,
    kind VARCHAR(64) NOT NULL,
    uri TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for the metrics table.
pub const CREATE_METRICS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS metrics (
    id UUID PRIMARY KEY,
    scene_id UUID NOT NULL REFERENCES scenes(id) ON DELETE CASCADE,
    name VARCHAR(128) NOT NULL,
    value DOUBLE PRECISION NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for the audit_logs table.
pub const CREATE_AUDIT_LOGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS audit_logs (
    id UUID PRIMARY KEY,
    scene_id UUID NOT NULL REFERENCES scenes(id) ON DELETE CASCADE,
    action VARCHAR(128) NOT NULL,
    details JSONB,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL for creating all required indexes.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_artifacts_scene_kind ON artifacts(scene_id, kind, created_at);
CREATE INDEX IF NOT EXISTS idx_metrics_scene_name ON metrics(scene_id, name, created_at);
CREATE INDEX IF NOT EXISTS idx_audit_logs_scene ON audit_logs(scene_id, created_at);
CREATE INDEX IF NOT EXISTS idx_scenes_created_at ON scenes(created_at)
"#;

/// Returns all schema creation statements in dependency order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_SCENES_TABLE,
        CREATE_ARTIFACTS_TABLE,
        CREATE_METRICS_TABLE,
        CREATE_AUDIT_LOGS_TABLE,
        CREATE_INDEXES,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statement_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 5);
        // Scenes first; every child table references it.
        assert!(statements[0].contains("scenes"));
        assert!(statements[4].contains("CREATE INDEX"));
    }

    #[test]
    fn test_child_tables_cascade() {
        for stmt in [
            CREATE_ARTIFACTS_TABLE,
            CREATE_METRICS_TABLE,
            CREATE_AUDIT_LOGS_TABLE,
        ] {
            assert!(stmt.contains("ON DELETE CASCADE"));
        }
    }
}
