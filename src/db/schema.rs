pub const SCHEMA: &str = r#"
-- Captures table: one row per completed photo event.
-- Rows are append-only; no update or delete path exists in this subsystem.
CREATE TABLE IF NOT EXISTS captures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    image_uri TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    captured_at INTEGER NOT NULL   -- epoch milliseconds
);

CREATE INDEX IF NOT EXISTS idx_captures_captured_at ON captures(captured_at);

-- Upload outbox: durable record of a pending remote transfer, keyed by the
-- local capture it belongs to. Retried by the upload worker until it is
-- acknowledged or exhausts its attempts.
CREATE TABLE IF NOT EXISTS upload_outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    capture_id INTEGER NOT NULL UNIQUE,
    staging_path TEXT NOT NULL,
    object_key TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',  -- pending/uploading/uploaded/failed
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_at INTEGER NOT NULL,        -- epoch milliseconds
    last_error TEXT,
    FOREIGN KEY (capture_id) REFERENCES captures(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_outbox_status ON upload_outbox(status);
CREATE INDEX IF NOT EXISTS idx_outbox_next_attempt ON upload_outbox(next_attempt_at);
"#;
