//! Logical table name map, grounded on the column-family constant table in
//! `coordination/src/state/schema.rs`. Every query template in this crate
//! refers to tables through the `{{logical}}` token on the left so the
//! adapter (see `super::resolve_tables`) can choose the embedded or
//! networked physical name without the caller knowing which backend it's
//! talking to.

/// `(logical name) -> (embedded physical name, networked physical name)`.
pub const TABLE_MAP: &[(&str, (&str, &str))] = &[
    ("agents", ("agents", "gitswarm_agents")),
    ("repos", ("repos", "gitswarm_repos")),
    ("streams", ("streams", "gitswarm_streams")),
    ("stream_reviews", ("stream_reviews", "gitswarm_stream_reviews")),
    ("tasks", ("tasks", "gitswarm_tasks")),
    ("task_claims", ("task_claims", "gitswarm_task_claims")),
    (
        "stabilizations",
        ("stabilizations", "gitswarm_stabilizations"),
    ),
    ("branch_rules", ("branch_rules", "gitswarm_branch_rules")),
    (
        "maintainer_grants",
        ("maintainer_grants", "gitswarm_maintainer_grants"),
    ),
    (
        "explicit_grants",
        ("explicit_grants", "gitswarm_explicit_grants"),
    ),
    ("sync_events", ("sync_events", "gitswarm_sync_events")),
    ("merge_queue", ("merge_queue", "gitswarm_merge_queue")),
    (
        "stream_conflicts",
        ("stream_conflicts", "gitswarm_stream_conflicts"),
    ),
];

/// DDL for the embedded (SQLite) backend. The networked backend's schema is
/// owned and migrated by the server deployment, out of scope here (spec §1
/// treats the server-side runtime as a peer the engine talks to, not
/// something it provisions from the client).
pub const SQLITE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT UNIQUE NOT NULL,
    karma REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS repos (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    merge_mode TEXT NOT NULL DEFAULT 'review',
    ownership_model TEXT NOT NULL DEFAULT 'guild',
    consensus_threshold REAL NOT NULL DEFAULT 0.66,
    min_reviews INTEGER NOT NULL DEFAULT 1,
    human_review_weight REAL NOT NULL DEFAULT 1.5,
    agent_access TEXT NOT NULL DEFAULT 'public',
    min_karma REAL NOT NULL DEFAULT 0,
    buffer_branch TEXT NOT NULL DEFAULT 'buffer',
    promote_target TEXT NOT NULL DEFAULT 'main',
    auto_promote_on_green INTEGER NOT NULL DEFAULT 0,
    auto_revert_on_red INTEGER NOT NULL DEFAULT 1,
    stabilize_command TEXT NOT NULL DEFAULT '',
    stage TEXT NOT NULL DEFAULT 'seed',
    consensus_authority TEXT NOT NULL DEFAULT 'local'
);

CREATE TABLE IF NOT EXISTS streams (
    id TEXT PRIMARY KEY,
    repo_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    branch TEXT NOT NULL,
    base_branch TEXT NOT NULL,
    parent_stream_id TEXT,
    task_id TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    review_status TEXT NOT NULL DEFAULT 'pending',
    source TEXT NOT NULL DEFAULT 'cli',
    metadata TEXT NOT NULL DEFAULT '{}',
    UNIQUE(repo_id, branch)
);

CREATE TABLE IF NOT EXISTS stream_reviews (
    id TEXT PRIMARY KEY,
    stream_id TEXT NOT NULL,
    reviewer_id TEXT NOT NULL,
    verdict TEXT NOT NULL,
    is_human INTEGER NOT NULL DEFAULT 0,
    tested INTEGER NOT NULL DEFAULT 0,
    reviewed_at TEXT NOT NULL,
    UNIQUE(stream_id, reviewer_id)
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    repo_id TEXT NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    priority INTEGER NOT NULL DEFAULT 50
);

CREATE TABLE IF NOT EXISTS task_claims (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    stream_id TEXT,
    status TEXT NOT NULL DEFAULT 'active'
);

CREATE TABLE IF NOT EXISTS stabilizations (
    repo_id TEXT NOT NULL,
    result TEXT NOT NULL,
    buffer_commit TEXT NOT NULL,
    tag TEXT,
    breaking_stream_id TEXT,
    details TEXT NOT NULL DEFAULT '',
    stabilized_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS branch_rules (
    repo_id TEXT NOT NULL,
    branch_pattern TEXT NOT NULL,
    direct_push TEXT NOT NULL DEFAULT 'all',
    required_approvals INTEGER NOT NULL DEFAULT 0,
    require_tests_pass INTEGER NOT NULL DEFAULT 0,
    consensus_threshold_override REAL,
    priority INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS maintainer_grants (
    repo_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    role TEXT NOT NULL,
    UNIQUE(repo_id, agent_id)
);

CREATE TABLE IF NOT EXISTS explicit_grants (
    repo_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    level TEXT NOT NULL,
    expires_at TEXT,
    UNIQUE(repo_id, agent_id)
);

CREATE TABLE IF NOT EXISTS sync_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    dead INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS merge_queue (
    stream_id TEXT PRIMARY KEY,
    repo_id TEXT NOT NULL,
    priority_rank INTEGER NOT NULL,
    consensus_timestamp TEXT NOT NULL,
    enqueue_seq INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS stream_conflicts (
    stream_id TEXT NOT NULL,
    files TEXT NOT NULL,
    src TEXT NOT NULL,
    tgt TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
);
"#;
