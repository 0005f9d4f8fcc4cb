//! Forward-only schema revisions. Never edit a shipped revision; append a
//! new one.

pub(crate) const MIGRATIONS: &[(i64, &str)] = &[
    (1, M0001_IDENTITIES),
    (2, M0002_WORKLOG),
    (3, M0003_GUARDS_AND_AUDIT),
    (4, M0004_INVOICES),
    (5, M0005_BOT_MENU),
];

const M0001_IDENTITIES: &str = "
CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    telegram_id INTEGER UNIQUE,
    role TEXT NOT NULL CHECK (role IN ('admin', 'foreman', 'worker')),
    status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'inactive')),
    daily_rate TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE auth_credentials (
    user_id INTEGER PRIMARY KEY REFERENCES users (id),
    password_hash TEXT,
    pin_hash TEXT,
    pin_fingerprint TEXT UNIQUE,
    last_login TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE refresh_tokens (
    jti TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users (id),
    expires_at TEXT NOT NULL,
    revoked INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE clients (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    contact TEXT,
    default_pricing_rule TEXT NOT NULL DEFAULT 'hour_general',
    status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'archived')),
    created_at TEXT NOT NULL
);
";

const M0002_WORKLOG: &str = "
CREATE TABLE shifts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users (id),
    client_id INTEGER REFERENCES clients (id),
    work_address TEXT,
    status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'closed')),
    created_at TEXT NOT NULL,
    ended_at TEXT
);
CREATE INDEX idx_shifts_user_status ON shifts (user_id, status);

CREATE TABLE tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    shift_id INTEGER NOT NULL REFERENCES shifts (id),
    rate_code TEXT NOT NULL,
    qty TEXT NOT NULL,
    amount TEXT NOT NULL,
    pricing_sha TEXT NOT NULL,
    rules_sha TEXT NOT NULL,
    worker TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN ('pending', 'approved', 'rejected')),
    created_at TEXT NOT NULL
);
CREATE INDEX idx_tasks_status_created ON tasks (status, created_at);

CREATE TABLE expenses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    worker_id INTEGER NOT NULL REFERENCES users (id),
    shift_id INTEGER REFERENCES shifts (id),
    category TEXT NOT NULL,
    amount TEXT NOT NULL,
    currency TEXT NOT NULL DEFAULT 'ILS',
    photo_ref TEXT,
    ocr_status TEXT NOT NULL DEFAULT 'off' CHECK (ocr_status IN ('off', 'abstain', 'ok')),
    status TEXT NOT NULL DEFAULT 'needs_approval'
        CHECK (status IN ('needs_approval', 'approved', 'rejected')),
    date TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX idx_expenses_status_created ON expenses (status, created_at);
";

const M0003_GUARDS_AND_AUDIT: &str = "
CREATE TABLE idempotency_keys (
    key TEXT PRIMARY KEY,
    scope_hash TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'applied',
    response_json TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX idx_idempotency_scope_hash ON idempotency_keys (scope_hash);

CREATE TABLE audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    target_kind TEXT NOT NULL,
    target_id INTEGER,
    payload_hash TEXT NOT NULL,
    outcome TEXT NOT NULL CHECK (outcome IN ('applied', 'rejected', 'noop')),
    reason TEXT,
    ts TEXT NOT NULL
);
CREATE INDEX idx_audit_target ON audit_log (target_kind, target_id);
CREATE INDEX idx_audit_actor ON audit_log (actor);
";

const M0004_INVOICES: &str = "
CREATE TABLE invoices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client_id INTEGER NOT NULL REFERENCES clients (id),
    period_from TEXT NOT NULL,
    period_to TEXT NOT NULL,
    currency TEXT NOT NULL DEFAULT 'ILS',
    subtotal TEXT NOT NULL,
    tax TEXT NOT NULL,
    total TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'draft'
        CHECK (status IN ('draft', 'issued', 'paid', 'cancelled')),
    version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    UNIQUE (client_id, period_from, period_to)
);

CREATE TABLE invoice_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    invoice_id INTEGER NOT NULL REFERENCES invoices (id),
    item_type TEXT NOT NULL,
    description TEXT NOT NULL,
    quantity TEXT NOT NULL,
    unit_price TEXT NOT NULL,
    amount TEXT NOT NULL,
    worker TEXT,
    site TEXT
);
CREATE INDEX idx_invoice_items_invoice ON invoice_items (invoice_id);

CREATE TABLE invoice_preview_tokens (
    token_hash TEXT PRIMARY KEY,
    invoice_id INTEGER NOT NULL REFERENCES invoices (id),
    issued_at TEXT NOT NULL,
    used_at TEXT
);
CREATE INDEX idx_preview_tokens_invoice ON invoice_preview_tokens (invoice_id);

CREATE TABLE invoice_suggestions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    invoice_id INTEGER NOT NULL REFERENCES invoices (id),
    kind TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open' CHECK (status IN ('open', 'applied', 'rejected')),
    created_at TEXT NOT NULL
);

CREATE TABLE invoice_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    invoice_id INTEGER NOT NULL REFERENCES invoices (id),
    version INTEGER NOT NULL,
    diff_json TEXT NOT NULL,
    sha TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (invoice_id, version)
);
";

const M0005_BOT_MENU: &str = "
CREATE TABLE bot_commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    role TEXT NOT NULL CHECK (role IN ('admin', 'foreman', 'worker')),
    command_key TEXT NOT NULL,
    telegram_command TEXT NOT NULL,
    label TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1,
    is_core INTEGER NOT NULL DEFAULT 0,
    position INTEGER NOT NULL DEFAULT 0,
    command_type TEXT NOT NULL DEFAULT 'menu',
    UNIQUE (role, command_key)
);

CREATE TABLE bot_menu_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL DEFAULT 1,
    last_updated_at TEXT,
    last_updated_by TEXT,
    last_applied_at TEXT,
    last_applied_by TEXT
);
INSERT INTO bot_menu_config (id, version) VALUES (1, 1);
";
