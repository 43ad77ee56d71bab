// ABOUTME: DDL for the log store: captured events, apply records, identity mappings
// ABOUTME: Indexed by primary key and by the coordinate, owning-event and domain lookups

/// Captured events. `(source_epoch, source_file, source_offset, row_index)` is
/// unique so a retried insert of an already-recorded row finds the existing
/// event. The epoch separates binlog generations whose file names repeat.
pub const CAPTURED_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS captured_events (
    event_id        BIGINT AUTO_INCREMENT PRIMARY KEY,
    captured_at     DATETIME(3) NOT NULL,
    source_epoch    INT UNSIGNED NOT NULL DEFAULT 0,
    source_file     VARCHAR(255) NOT NULL,
    source_offset   BIGINT UNSIGNED NOT NULL,
    row_index       INT UNSIGNED NOT NULL DEFAULT 0,
    source_time     DATETIME NOT NULL,
    `schema`        VARCHAR(64) NOT NULL,
    `table`         VARCHAR(64) NOT NULL,
    action          ENUM('insert', 'update', 'delete') NOT NULL,
    applied         TINYINT(1) NOT NULL DEFAULT 0,
    payload         LONGBLOB NOT NULL,
    UNIQUE KEY uq_event_coordinate (source_epoch, source_file, source_offset, row_index),
    KEY idx_event_captured_at (captured_at),
    KEY idx_event_source_time (source_time),
    KEY idx_event_applied (applied, event_id)
)"#;

pub const APPLY_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS apply_records (
    apply_id        BIGINT AUTO_INCREMENT PRIMARY KEY,
    event_id        BIGINT NULL,
    recorded_at     DATETIME(3) NOT NULL,
    `table`         VARCHAR(64) NOT NULL,
    action          ENUM('insert', 'update', 'delete') NOT NULL,
    executed        TINYINT(1) NOT NULL DEFAULT 0,
    statement       LONGBLOB NULL,
    KEY idx_apply_event_id (event_id),
    KEY idx_apply_recorded_at (recorded_at)
)
PARTITION BY HASH (apply_id) PARTITIONS 10"#;

pub const IDENTITY_MAPPINGS: &str = r#"
CREATE TABLE IF NOT EXISTS identity_mappings (
    mapping_id      BIGINT AUTO_INCREMENT PRIMARY KEY,
    domain          VARCHAR(64) NOT NULL,
    source_id       BIGINT NOT NULL,
    target_id       BIGINT NOT NULL,
    KEY idx_mapping_lookup (domain, source_id, mapping_id)
)
PARTITION BY HASH (mapping_id) PARTITIONS 5"#;

pub const ALL: &[&str] = &[CAPTURED_EVENTS, APPLY_RECORDS, IDENTITY_MAPPINGS];
