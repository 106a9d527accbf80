//! Embedded baseline DDL, applied once to an empty database. Creates the two
//! logical schemas (`app.*` for the user-defined model, `instance.*` for
//! platform state), the cluster schema, the per-installation schemas for file
//! attributes and encrypted relations, and the stable instance SQL surface
//! exposed to user-defined PG functions.

/// Schemas, ENUM types and tables.
pub const BASELINE_TABLES: &str = r#"
CREATE SCHEMA app;
CREATE SCHEMA instance;
CREATE SCHEMA instance_cluster;
CREATE SCHEMA instance_e2ee;
CREATE SCHEMA instance_file;

CREATE TYPE instance.login_token_fixed_context AS ENUM ('ics', 'client', 'totp');
CREATE TYPE instance.file_spool_content AS ENUM ('export', 'import');
CREATE TYPE app.attribute_content AS ENUM (
    'integer', 'bigint', 'numeric', 'real', 'double', 'varchar', 'text',
    'boolean', 'uuid', 'files', '1:1', 'n:1', 'n:m');
CREATE TYPE app.attribute_content_use AS ENUM (
    'default', 'date', 'datetime', 'time', 'richtext', 'textarea', 'color',
    'drawing', 'iframe', 'barcode', 'login');
CREATE TYPE app.role_content AS ENUM ('admin', 'user', 'other', 'everyone');

-- ━━━ app.* — the user-defined model ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

CREATE TABLE app.module (
    id UUID PRIMARY KEY,
    parent_id UUID REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    form_id UUID,
    icon_id UUID,
    name VARCHAR(60) NOT NULL UNIQUE,
    name_display VARCHAR(60),
    color1 CHAR(6),
    position_nav INTEGER NOT NULL DEFAULT 0,
    language_main CHAR(5) NOT NULL,
    release_build INTEGER NOT NULL DEFAULT 0,
    release_build_app INTEGER NOT NULL DEFAULT 0,
    release_date BIGINT NOT NULL DEFAULT 0,
    languages CHAR(5)[] NOT NULL DEFAULT '{}'
);

CREATE TABLE app.module_depends (
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    module_id_on UUID NOT NULL REFERENCES app.module (id) DEFERRABLE INITIALLY DEFERRED,
    PRIMARY KEY (module_id, module_id_on)
);

CREATE TABLE app.article (
    id UUID PRIMARY KEY,
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    name VARCHAR(64) NOT NULL
);

CREATE TABLE app.relation (
    id UUID PRIMARY KEY,
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    name VARCHAR(60) NOT NULL,
    comment TEXT,
    encryption BOOLEAN NOT NULL DEFAULT FALSE,
    retention_count INTEGER,
    retention_days INTEGER,
    UNIQUE (module_id, name)
);

CREATE TABLE app.attribute (
    id UUID PRIMARY KEY,
    relation_id UUID NOT NULL REFERENCES app.relation (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    relationship_id UUID REFERENCES app.relation (id) DEFERRABLE INITIALLY DEFERRED,
    icon_id UUID,
    name VARCHAR(60) NOT NULL,
    content app.attribute_content NOT NULL,
    content_use app.attribute_content_use NOT NULL DEFAULT 'default',
    length INTEGER NOT NULL DEFAULT 0,
    nullable BOOLEAN NOT NULL DEFAULT TRUE,
    encrypted BOOLEAN NOT NULL DEFAULT FALSE,
    def TEXT NOT NULL DEFAULT '',
    on_update VARCHAR(32),
    on_delete VARCHAR(32),
    UNIQUE (relation_id, name)
);
CREATE INDEX idx_attribute_relation ON app.attribute (relation_id);

CREATE TABLE app.relation_index (
    id UUID PRIMARY KEY,
    relation_id UUID NOT NULL REFERENCES app.relation (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    method VARCHAR(12) NOT NULL DEFAULT 'BTREE',
    no_duplicates BOOLEAN NOT NULL DEFAULT FALSE,
    auto_fki BOOLEAN NOT NULL DEFAULT FALSE,
    primary_key BOOLEAN NOT NULL DEFAULT FALSE,
    attribute_ids UUID[] NOT NULL DEFAULT '{}'
);

CREATE TABLE app.preset (
    id UUID PRIMARY KEY,
    relation_id UUID NOT NULL REFERENCES app.relation (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    name VARCHAR(64) NOT NULL,
    protected BOOLEAN NOT NULL DEFAULT FALSE,
    UNIQUE (relation_id, name)
);

CREATE TABLE app.preset_value (
    id UUID PRIMARY KEY,
    preset_id UUID NOT NULL REFERENCES app.preset (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    attribute_id UUID NOT NULL REFERENCES app.attribute (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    preset_id_refer UUID REFERENCES app.preset (id) DEFERRABLE INITIALLY DEFERRED,
    protected BOOLEAN NOT NULL DEFAULT FALSE,
    value TEXT NOT NULL DEFAULT ''
);

-- Maps schema presets onto the concrete rows they created per instance.
CREATE TABLE instance.preset_record (
    preset_id UUID NOT NULL REFERENCES app.preset (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    record_id_wofk BIGINT NOT NULL,
    PRIMARY KEY (preset_id)
);

CREATE TABLE app.role (
    id UUID PRIMARY KEY,
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    name VARCHAR(64) NOT NULL,
    content app.role_content NOT NULL DEFAULT 'user',
    assignable BOOLEAN NOT NULL DEFAULT TRUE,
    UNIQUE (module_id, name)
);

CREATE TABLE app.role_child (
    role_id UUID NOT NULL REFERENCES app.role (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    role_id_child UUID NOT NULL REFERENCES app.role (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    PRIMARY KEY (role_id, role_id_child)
);

-- One grant row per (role, entity); exactly one entity id column is set.
CREATE TABLE app.role_access (
    role_id UUID NOT NULL REFERENCES app.role (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    relation_id UUID REFERENCES app.relation (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    attribute_id UUID REFERENCES app.attribute (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    collection_id UUID,
    menu_id UUID,
    api_id UUID,
    client_event_id UUID,
    search_bar_id UUID,
    widget_id UUID,
    access SMALLINT NOT NULL DEFAULT 0
);
CREATE INDEX idx_role_access_role ON app.role_access (role_id);

CREATE TABLE app.relation_policy (
    relation_id UUID NOT NULL REFERENCES app.relation (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    position_order INTEGER NOT NULL DEFAULT 0,
    role_id UUID NOT NULL REFERENCES app.role (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    pg_function_id_select UUID,
    pg_function_id_update UUID,
    pg_function_id_delete UUID,
    action_select BOOLEAN NOT NULL DEFAULT FALSE,
    action_update BOOLEAN NOT NULL DEFAULT FALSE,
    action_delete BOOLEAN NOT NULL DEFAULT FALSE,
    PRIMARY KEY (relation_id, position_order)
);

CREATE TABLE app.pg_function (
    id UUID PRIMARY KEY,
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    name VARCHAR(60) NOT NULL,
    code_args TEXT NOT NULL DEFAULT '',
    code_function TEXT NOT NULL DEFAULT '',
    code_returns TEXT NOT NULL DEFAULT '',
    is_frontend_exec BOOLEAN NOT NULL DEFAULT FALSE,
    is_login_sync BOOLEAN NOT NULL DEFAULT FALSE,
    is_trigger BOOLEAN NOT NULL DEFAULT FALSE,
    cost INTEGER NOT NULL DEFAULT 100,
    UNIQUE (module_id, name)
);

CREATE TABLE app.pg_function_schedule (
    id UUID PRIMARY KEY,
    pg_function_id UUID NOT NULL REFERENCES app.pg_function (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    at_second INTEGER NOT NULL DEFAULT 0,
    at_minute INTEGER NOT NULL DEFAULT 0,
    at_hour INTEGER NOT NULL DEFAULT 0,
    at_day INTEGER NOT NULL DEFAULT 0,
    interval_type VARCHAR(10) NOT NULL,
    interval_value INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE app.trigger (
    id UUID PRIMARY KEY,
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    relation_id UUID NOT NULL REFERENCES app.relation (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    pg_function_id UUID NOT NULL REFERENCES app.pg_function (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    fires VARCHAR(12) NOT NULL DEFAULT 'BEFORE',
    on_insert BOOLEAN NOT NULL DEFAULT FALSE,
    on_update BOOLEAN NOT NULL DEFAULT FALSE,
    on_delete BOOLEAN NOT NULL DEFAULT FALSE,
    is_constraint BOOLEAN NOT NULL DEFAULT FALSE,
    is_deferrable BOOLEAN NOT NULL DEFAULT FALSE,
    is_deferred BOOLEAN NOT NULL DEFAULT FALSE,
    per_row BOOLEAN NOT NULL DEFAULT TRUE,
    code_condition TEXT
);

CREATE TABLE app.js_function (
    id UUID PRIMARY KEY,
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    form_id UUID,
    name VARCHAR(60) NOT NULL,
    code_args TEXT NOT NULL DEFAULT '',
    code_function TEXT NOT NULL DEFAULT '',
    code_returns TEXT NOT NULL DEFAULT '',
    is_client_event_exec BOOLEAN NOT NULL DEFAULT FALSE,
    UNIQUE (module_id, name)
);

-- Queries and field trees are persisted as the assembled JSON tree on their
-- owning entity; the Builder validates the graph (cycle-free) at insert.
CREATE TABLE app.form (
    id UUID PRIMARY KEY,
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    preset_id_open UUID,
    icon_id UUID,
    name VARCHAR(64) NOT NULL,
    no_data_actions BOOLEAN NOT NULL DEFAULT FALSE,
    query JSONB NOT NULL DEFAULT '{}',
    fields JSONB NOT NULL DEFAULT '[]',
    UNIQUE (module_id, name)
);

CREATE TABLE app.menu_tab (
    id UUID PRIMARY KEY,
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    icon_id UUID,
    position_order INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE app.menu (
    id UUID PRIMARY KEY,
    menu_tab_id UUID NOT NULL REFERENCES app.menu_tab (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    parent_id UUID REFERENCES app.menu (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    form_id UUID,
    icon_id UUID,
    position_order INTEGER NOT NULL DEFAULT 0,
    show_children BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE TABLE app.icon (
    id UUID PRIMARY KEY,
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    name VARCHAR(64) NOT NULL DEFAULT '',
    file BYTEA NOT NULL
);

CREATE TABLE app.login_form (
    id UUID PRIMARY KEY,
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    form_id UUID NOT NULL,
    attribute_id_login UUID NOT NULL,
    attribute_id_lookup UUID NOT NULL,
    name VARCHAR(64) NOT NULL
);

CREATE TABLE app.collection (
    id UUID PRIMARY KEY,
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    icon_id UUID,
    name VARCHAR(64) NOT NULL,
    query JSONB NOT NULL DEFAULT '{}',
    columns JSONB NOT NULL DEFAULT '[]',
    UNIQUE (module_id, name)
);

CREATE TABLE app.api (
    id UUID PRIMARY KEY,
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    name VARCHAR(64) NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    has_delete BOOLEAN NOT NULL DEFAULT FALSE,
    has_get BOOLEAN NOT NULL DEFAULT TRUE,
    has_post BOOLEAN NOT NULL DEFAULT FALSE,
    limit_def INTEGER NOT NULL DEFAULT 100,
    limit_max INTEGER NOT NULL DEFAULT 1000,
    verbose_def BOOLEAN NOT NULL DEFAULT FALSE,
    query JSONB NOT NULL DEFAULT '{}',
    columns JSONB NOT NULL DEFAULT '[]',
    UNIQUE (module_id, name, version)
);

CREATE TABLE app.client_event (
    id UUID PRIMARY KEY,
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    action VARCHAR(32) NOT NULL,
    arguments TEXT[] NOT NULL DEFAULT '{}',
    event VARCHAR(32) NOT NULL,
    hotkey_modifier1 VARCHAR(12),
    hotkey_modifier2 VARCHAR(12),
    hotkey_char CHAR(1),
    js_function_id UUID,
    pg_function_id UUID
);

CREATE TABLE app.search_bar (
    id UUID PRIMARY KEY,
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    icon_id UUID,
    name VARCHAR(64) NOT NULL,
    query JSONB NOT NULL DEFAULT '{}',
    columns JSONB NOT NULL DEFAULT '[]'
);

CREATE TABLE app.variable (
    id UUID PRIMARY KEY,
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    form_id UUID,
    name VARCHAR(64) NOT NULL,
    content VARCHAR(32) NOT NULL,
    content_use VARCHAR(32) NOT NULL DEFAULT 'default',
    def JSONB
);

CREATE TABLE app.widget (
    id UUID PRIMARY KEY,
    module_id UUID NOT NULL REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    form_id UUID,
    name VARCHAR(64) NOT NULL,
    size INTEGER NOT NULL DEFAULT 1,
    collection_id UUID
);

-- ━━━ instance.* — platform state ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

CREATE TABLE instance.config (
    name VARCHAR(64) PRIMARY KEY,
    value TEXT NOT NULL DEFAULT ''
);

CREATE TABLE instance.module_meta (
    module_id UUID PRIMARY KEY REFERENCES app.module (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    hash CHAR(44) NOT NULL DEFAULT '',
    release_build INTEGER NOT NULL DEFAULT 0,
    release_build_app INTEGER NOT NULL DEFAULT 0,
    release_date BIGINT NOT NULL DEFAULT 0,
    languages_custom CHAR(5)[] NOT NULL DEFAULT '{}',
    date_change BIGINT NOT NULL DEFAULT 0,
    owner BOOLEAN NOT NULL DEFAULT FALSE,
    hidden BOOLEAN NOT NULL DEFAULT FALSE,
    position_nav INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE instance.login (
    id BIGSERIAL PRIMARY KEY,
    name VARCHAR(128) NOT NULL UNIQUE,
    salt CHAR(32),
    hash CHAR(64),
    salt_kdf CHAR(32) NOT NULL,
    admin BOOLEAN NOT NULL DEFAULT FALSE,
    no_auth BOOLEAN NOT NULL DEFAULT FALSE,
    active BOOLEAN NOT NULL DEFAULT TRUE,
    language_code CHAR(5) NOT NULL DEFAULT 'en_us',
    oauth_client_id INTEGER,
    oauth_iss TEXT,
    oauth_sub TEXT,
    date_favorites BIGINT NOT NULL DEFAULT 0
);

CREATE TABLE instance.login_role (
    login_id BIGINT NOT NULL REFERENCES instance.login (id) ON DELETE CASCADE,
    role_id UUID NOT NULL REFERENCES app.role (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    PRIMARY KEY (login_id, role_id)
);

CREATE TABLE instance.login_session (
    id UUID PRIMARY KEY,
    device VARCHAR(12) NOT NULL,
    login_id BIGINT NOT NULL REFERENCES instance.login (id) ON DELETE CASCADE,
    node_id UUID NOT NULL,
    date BIGINT NOT NULL,
    address TEXT NOT NULL DEFAULT ''
);
CREATE INDEX idx_login_session_node ON instance.login_session (node_id);

CREATE TABLE instance.login_token_fixed (
    id BIGSERIAL PRIMARY KEY,
    login_id BIGINT NOT NULL REFERENCES instance.login (id) ON DELETE CASCADE,
    name VARCHAR(64),
    context instance.login_token_fixed_context NOT NULL,
    token CHAR(48) NOT NULL,
    date_create BIGINT NOT NULL,
    UNIQUE (login_id, token)
);

CREATE TABLE instance.oauth_client (
    id SERIAL PRIMARY KEY,
    name VARCHAR(64) NOT NULL UNIQUE,
    flow VARCHAR(32) NOT NULL DEFAULT 'authCodePkce',
    client_id TEXT NOT NULL,
    client_secret TEXT NOT NULL DEFAULT '',
    date_expiry BIGINT,
    provider_url TEXT NOT NULL DEFAULT '',
    redirect_url TEXT NOT NULL DEFAULT '',
    token_url TEXT NOT NULL DEFAULT '',
    scopes TEXT[] NOT NULL DEFAULT '{}',
    tenant TEXT,
    claim_username TEXT,
    claim_roles TEXT
);

CREATE TABLE instance.login_role_assign (
    id SERIAL PRIMARY KEY,
    oauth_client_id INTEGER REFERENCES instance.oauth_client (id) ON DELETE CASCADE,
    search_string TEXT NOT NULL,
    role_id UUID NOT NULL REFERENCES app.role (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED
);

CREATE TABLE instance.log (
    id BIGSERIAL PRIMARY KEY,
    level SMALLINT NOT NULL,
    context VARCHAR(12) NOT NULL,
    message TEXT NOT NULL,
    date_milli BIGINT NOT NULL,
    node_id UUID,
    module_id UUID
);
CREATE INDEX idx_log_date ON instance.log (date_milli);

CREATE TABLE instance.file (
    id UUID PRIMARY KEY,
    ref_counter INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE instance.file_version (
    file_id UUID NOT NULL REFERENCES instance.file (id) ON DELETE CASCADE,
    version INTEGER NOT NULL,
    hash CHAR(64),
    size_kb INTEGER NOT NULL DEFAULT 0,
    login_id BIGINT,
    date_change BIGINT NOT NULL,
    PRIMARY KEY (file_id, version)
);

CREATE TABLE instance.file_spool (
    id BIGSERIAL PRIMARY KEY,
    file_id UUID,
    record_id BIGINT,
    attribute_id UUID,
    content instance.file_spool_content NOT NULL,
    file_path TEXT NOT NULL DEFAULT '',
    overwrite BOOLEAN NOT NULL DEFAULT FALSE,
    date_added BIGINT NOT NULL
);

CREATE TABLE instance.data_log (
    id UUID PRIMARY KEY,
    relation_id UUID NOT NULL,
    record_id_wofk BIGINT NOT NULL,
    login_id_wofk BIGINT NOT NULL,
    date_change BIGINT NOT NULL
);
CREATE INDEX idx_data_log_record ON instance.data_log (relation_id, record_id_wofk);

CREATE TABLE instance.data_log_value (
    data_log_id UUID NOT NULL REFERENCES instance.data_log (id) ON DELETE CASCADE,
    attribute_id UUID NOT NULL,
    value_old TEXT,
    value_new TEXT
);

CREATE TABLE instance.mail_account (
    id SERIAL PRIMARY KEY,
    name VARCHAR(64) NOT NULL UNIQUE,
    mode VARCHAR(12) NOT NULL,
    auth_method VARCHAR(12) NOT NULL DEFAULT 'plain',
    username TEXT NOT NULL DEFAULT '',
    password TEXT NOT NULL DEFAULT '',
    start_tls BOOLEAN NOT NULL DEFAULT TRUE,
    send_as TEXT,
    host_name TEXT NOT NULL,
    host_port INTEGER NOT NULL
);

CREATE TABLE instance.mail_spool (
    id BIGSERIAL PRIMARY KEY,
    to_list TEXT NOT NULL DEFAULT '',
    cc_list TEXT NOT NULL DEFAULT '',
    bcc_list TEXT NOT NULL DEFAULT '',
    subject TEXT NOT NULL DEFAULT '',
    body TEXT NOT NULL DEFAULT '',
    outgoing BOOLEAN NOT NULL DEFAULT TRUE,
    date BIGINT NOT NULL,
    mail_account_id INTEGER REFERENCES instance.mail_account (id) ON DELETE SET NULL,
    record_id_wofk BIGINT,
    attribute_id UUID,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    attempt_date BIGINT NOT NULL DEFAULT 0
);

CREATE TABLE instance.mail_spool_file (
    mail_id BIGINT NOT NULL REFERENCES instance.mail_spool (id) ON DELETE CASCADE,
    position_order INTEGER NOT NULL,
    file BYTEA NOT NULL,
    file_name TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    PRIMARY KEY (mail_id, position_order)
);

CREATE TABLE instance.mail_traffic (
    from_list TEXT NOT NULL DEFAULT '',
    to_list TEXT NOT NULL DEFAULT '',
    cc_list TEXT NOT NULL DEFAULT '',
    bcc_list TEXT NOT NULL DEFAULT '',
    subject TEXT NOT NULL,
    date BIGINT NOT NULL,
    outgoing BOOLEAN NOT NULL,
    files TEXT[] NOT NULL DEFAULT '{}',
    mail_account_id INTEGER
);
CREATE INDEX idx_mail_traffic_date ON instance.mail_traffic (date);

CREATE TABLE instance.rest_spool (
    id BIGSERIAL PRIMARY KEY,
    method VARCHAR(12) NOT NULL,
    url TEXT NOT NULL,
    headers JSONB,
    body TEXT,
    skip_verify BOOLEAN NOT NULL DEFAULT FALSE,
    callback_pg_function_id UUID,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    date_added BIGINT NOT NULL
);

CREATE TABLE instance.task (
    name VARCHAR(64) PRIMARY KEY,
    interval_seconds BIGINT NOT NULL,
    cluster_master_only BOOLEAN NOT NULL DEFAULT TRUE,
    embedded_only BOOLEAN NOT NULL DEFAULT FALSE,
    active_only BOOLEAN NOT NULL DEFAULT FALSE,
    active BOOLEAN NOT NULL DEFAULT TRUE
);

CREATE TABLE instance.schedule (
    id BIGSERIAL PRIMARY KEY,
    task_name VARCHAR(64) REFERENCES instance.task (name) ON DELETE CASCADE,
    pg_function_schedule_id UUID REFERENCES app.pg_function_schedule (id) ON DELETE CASCADE DEFERRABLE INITIALLY DEFERRED,
    date_attempt BIGINT NOT NULL DEFAULT 0,
    date_success BIGINT NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX idx_schedule_task ON instance.schedule (task_name) WHERE task_name IS NOT NULL;
CREATE UNIQUE INDEX idx_schedule_fnc ON instance.schedule (pg_function_schedule_id) WHERE pg_function_schedule_id IS NOT NULL;

-- ━━━ instance_cluster.* ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

CREATE TABLE instance_cluster.node (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    hostname TEXT NOT NULL,
    date_check_in BIGINT NOT NULL DEFAULT 0,
    date_started BIGINT NOT NULL DEFAULT 0,
    stat_sessions INTEGER NOT NULL DEFAULT -1,
    stat_memory INTEGER NOT NULL DEFAULT -1,
    cluster_master BOOLEAN NOT NULL DEFAULT FALSE,
    running BOOLEAN NOT NULL DEFAULT FALSE
);

CREATE TABLE instance_cluster.node_event (
    id BIGSERIAL PRIMARY KEY,
    node_id UUID NOT NULL REFERENCES instance_cluster.node (id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    payload TEXT NOT NULL DEFAULT '',
    target_address TEXT,
    target_device VARCHAR(12),
    target_login_id BIGINT
);
CREATE INDEX idx_node_event_node ON instance_cluster.node_event (node_id, id);

CREATE TABLE instance_cluster.node_schedule (
    node_id UUID NOT NULL REFERENCES instance_cluster.node (id) ON DELETE CASCADE,
    schedule_id BIGINT NOT NULL REFERENCES instance.schedule (id) ON DELETE CASCADE,
    date_attempt BIGINT NOT NULL DEFAULT 0,
    date_success BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (node_id, schedule_id)
);
"#;

/// The stable SQL surface exposed to user-defined PG functions, plus the
/// platform-internal cluster functions. Contracts (arity, types, effects on
/// spool tables and events) are frozen.
pub const BASELINE_FUNCTIONS: &str = r#"
CREATE FUNCTION instance.log(level INTEGER, message TEXT, app_name TEXT DEFAULT NULL)
RETURNS VOID AS $$
DECLARE
    module_id UUID;
BEGIN
    IF app_name IS NOT NULL THEN
        SELECT id INTO module_id FROM app.module WHERE name = app_name;
    END IF;
    INSERT INTO instance.log (level, context, message, date_milli, node_id, module_id)
    VALUES (level, 'module', message, (EXTRACT(EPOCH FROM NOW()) * 1000)::BIGINT, NULL, module_id);
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.log_error(message TEXT, app_name TEXT DEFAULT NULL)
RETURNS VOID AS $$ BEGIN PERFORM instance.log(1, message, app_name); END; $$ LANGUAGE plpgsql;

CREATE FUNCTION instance.log_warning(message TEXT, app_name TEXT DEFAULT NULL)
RETURNS VOID AS $$ BEGIN PERFORM instance.log(2, message, app_name); END; $$ LANGUAGE plpgsql;

CREATE FUNCTION instance.log_info(message TEXT, app_name TEXT DEFAULT NULL)
RETURNS VOID AS $$ BEGIN PERFORM instance.log(3, message, app_name); END; $$ LANGUAGE plpgsql;

CREATE FUNCTION instance.mail_send(
    subject TEXT,
    body TEXT,
    to_list TEXT DEFAULT '',
    cc_list TEXT DEFAULT '',
    bcc_list TEXT DEFAULT '',
    account_name TEXT DEFAULT NULL,
    attach_record_id BIGINT DEFAULT NULL,
    attach_attribute_id UUID DEFAULT NULL)
RETURNS INTEGER AS $$
DECLARE
    account_id INTEGER;
BEGIN
    IF account_name IS NOT NULL THEN
        SELECT id INTO account_id FROM instance.mail_account WHERE name = account_name;
    END IF;
    INSERT INTO instance.mail_spool (to_list, cc_list, bcc_list, subject, body, date,
        mail_account_id, record_id_wofk, attribute_id)
    VALUES (to_list, cc_list, bcc_list, subject, body, EXTRACT(EPOCH FROM NOW())::BIGINT,
        account_id, attach_record_id, attach_attribute_id);
    RETURN 0;
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.mail_get_next(account_name TEXT DEFAULT NULL)
RETURNS instance.mail_spool AS $$
DECLARE
    m instance.mail_spool;
BEGIN
    SELECT * INTO m FROM instance.mail_spool
    WHERE outgoing = FALSE
    AND (account_name IS NULL OR mail_account_id = (
        SELECT id FROM instance.mail_account WHERE name = account_name))
    ORDER BY id ASC LIMIT 1;
    RETURN m;
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.mail_delete(mail_id BIGINT)
RETURNS INTEGER AS $$
BEGIN
    DELETE FROM instance.mail_spool WHERE id = mail_id;
    RETURN 0;
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.mail_delete_after_attach(mail_id BIGINT, attach_record_id BIGINT, attach_attribute_id UUID)
RETURNS INTEGER AS $$
BEGIN
    UPDATE instance.mail_spool
    SET record_id_wofk = attach_record_id, attribute_id = attach_attribute_id
    WHERE id = mail_id AND outgoing = FALSE;
    RETURN 0;
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.file_link(file_id UUID, record_id BIGINT, attribute_id UUID)
RETURNS VOID AS $$
BEGIN
    EXECUTE FORMAT(
        'INSERT INTO instance_file.%I (file_id, record_id, name, date_delete)
         VALUES ($1, $2, $3, NULL) ON CONFLICT (file_id, record_id) DO UPDATE SET date_delete = NULL',
        CONCAT(attribute_id, '_record')) USING file_id, record_id, file_id::TEXT;
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.file_unlink(file_id UUID, record_id BIGINT, attribute_id UUID)
RETURNS VOID AS $$
BEGIN
    EXECUTE FORMAT(
        'UPDATE instance_file.%I SET date_delete = $3 WHERE file_id = $1 AND record_id = $2',
        CONCAT(attribute_id, '_record'))
    USING file_id, record_id, EXTRACT(EPOCH FROM NOW())::BIGINT;
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.files_get(record_id BIGINT, attribute_id UUID, include_deleted BOOLEAN DEFAULT FALSE)
RETURNS TABLE (file_id UUID, name TEXT, date_delete BIGINT) AS $$
BEGIN
    RETURN QUERY EXECUTE FORMAT(
        'SELECT file_id, name, date_delete FROM instance_file.%I
         WHERE record_id = $1 AND ($2 OR date_delete IS NULL)',
        CONCAT(attribute_id, '_record')) USING record_id, include_deleted;
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.file_export(file_id UUID, record_id BIGINT, attribute_id UUID, dest_path TEXT, overwrite BOOLEAN DEFAULT FALSE)
RETURNS VOID AS $$
BEGIN
    INSERT INTO instance.file_spool (file_id, record_id, attribute_id, content, file_path, overwrite, date_added)
    VALUES (file_id, record_id, attribute_id, 'export', dest_path, overwrite, EXTRACT(EPOCH FROM NOW())::BIGINT);
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.file_import(source_path TEXT, record_id BIGINT, attribute_id UUID)
RETURNS VOID AS $$
BEGIN
    INSERT INTO instance.file_spool (record_id, attribute_id, content, file_path, date_added)
    VALUES (record_id, attribute_id, 'import', source_path, EXTRACT(EPOCH FROM NOW())::BIGINT);
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.rest_call(
    http_method TEXT,
    url TEXT,
    body TEXT DEFAULT NULL,
    headers JSONB DEFAULT NULL,
    callback_function_id UUID DEFAULT NULL,
    skip_verify BOOLEAN DEFAULT FALSE)
RETURNS VOID AS $$
BEGIN
    INSERT INTO instance.rest_spool (method, url, headers, body, skip_verify, callback_pg_function_id, date_added)
    VALUES (UPPER(http_method), url, headers, body, skip_verify, callback_function_id,
        EXTRACT(EPOCH FROM NOW())::BIGINT);
END;
$$ LANGUAGE plpgsql;

-- Request-scoped settings, set by the data layer per transaction.
CREATE FUNCTION instance.get_login_id()
RETURNS BIGINT AS $$
BEGIN
    RETURN NULLIF(CURRENT_SETTING('baseplate.login_id', TRUE), '')::BIGINT;
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.get_login_language_code()
RETURNS TEXT AS $$
DECLARE
    code TEXT;
BEGIN
    SELECT language_code INTO code FROM instance.login WHERE id = instance.get_login_id();
    RETURN code;
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.get_name(login_id BIGINT DEFAULT NULL)
RETURNS TEXT AS $$
DECLARE
    login_name TEXT;
BEGIN
    SELECT name INTO login_name FROM instance.login
    WHERE id = COALESCE(login_id, instance.get_login_id());
    RETURN login_name;
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.get_public_hostname()
RETURNS TEXT AS $$
DECLARE
    host TEXT;
BEGIN
    SELECT value INTO host FROM instance.config WHERE name = 'publicHostName';
    RETURN host;
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.get_role_ids(login_id BIGINT, inherited BOOLEAN DEFAULT FALSE)
RETURNS UUID[] AS $$
DECLARE
    ids UUID[];
BEGIN
    IF NOT inherited THEN
        SELECT ARRAY_AGG(role_id) INTO ids FROM instance.login_role WHERE login_role.login_id = get_role_ids.login_id;
    ELSE
        WITH RECURSIVE inherited_roles AS (
            SELECT role_id FROM instance.login_role WHERE login_role.login_id = get_role_ids.login_id
            UNION
            SELECT rc.role_id_child FROM app.role_child rc
            JOIN inherited_roles ir ON ir.role_id = rc.role_id
        )
        SELECT ARRAY_AGG(role_id) INTO ids FROM inherited_roles;
    END IF;
    RETURN COALESCE(ids, '{}');
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.has_role(login_id BIGINT, role_id UUID, inherited BOOLEAN DEFAULT FALSE)
RETURNS BOOLEAN AS $$
BEGIN
    RETURN role_id = ANY(instance.get_role_ids(login_id, inherited));
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.has_role_any(login_id BIGINT, role_ids UUID[], inherited BOOLEAN DEFAULT FALSE)
RETURNS BOOLEAN AS $$
BEGIN
    RETURN instance.get_role_ids(login_id, inherited) && role_ids;
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.update_collection(collection_id UUID, login_ids BIGINT[] DEFAULT '{}')
RETURNS VOID AS $$
BEGIN
    INSERT INTO instance_cluster.node_event (node_id, content, payload)
    SELECT id, 'collectionUpdated',
        JSON_BUILD_OBJECT('collectionId', collection_id, 'loginIds', login_ids)::TEXT
    FROM instance_cluster.node WHERE running;
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.abort_show_message(message TEXT)
RETURNS VOID AS $$
BEGIN
    RAISE EXCEPTION 'CUSTOM_ERROR_OTHER {%}', message;
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.user_sync(module_name TEXT, pg_function_name TEXT, login_id BIGINT, event_type TEXT)
RETURNS TEXT AS $$
BEGIN
    EXECUTE FORMAT('SELECT %I.%I($1, $2)', module_name, pg_function_name) USING login_id, event_type;
    RETURN '';
EXCEPTION WHEN OTHERS THEN
    RETURN SQLERRM;
END;
$$ LANGUAGE plpgsql;

CREATE FUNCTION instance.user_sync_all(module_name TEXT, pg_function_name TEXT)
RETURNS TEXT AS $$
DECLARE
    login RECORD;
    err TEXT;
BEGIN
    FOR login IN SELECT id FROM instance.login WHERE active LOOP
        err := instance.user_sync(module_name, pg_function_name, login.id, 'UPDATED');
        IF err <> '' THEN
            RETURN err;
        END IF;
    END LOOP;
    RETURN '';
END;
$$ LANGUAGE plpgsql;

-- Maintains instance.file.ref_counter as record links come and go. Attached
-- to every instance_file."<attributeId>_record" table at creation.
CREATE FUNCTION instance.file_ref_count_update()
RETURNS TRIGGER AS $$
BEGIN
    IF TG_OP = 'INSERT' THEN
        UPDATE instance.file SET ref_counter = ref_counter + 1 WHERE id = NEW.file_id;
        RETURN NEW;
    ELSIF TG_OP = 'DELETE' THEN
        UPDATE instance.file SET ref_counter = ref_counter - 1 WHERE id = OLD.file_id;
        RETURN OLD;
    END IF;
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;

-- ━━━ cluster functions ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

-- Request-based master election: flips the master flag iff the current
-- master has not checked in within the configured window. Row locks keep
-- concurrent requests serial; losing requests are no-ops.
CREATE FUNCTION instance_cluster.master_role_request(requesting_node_id UUID)
RETURNS BOOLEAN AS $$
DECLARE
    missing_after BIGINT;
    master_ok BOOLEAN;
BEGIN
    SELECT value::BIGINT INTO missing_after FROM instance.config WHERE name = 'clusterNodeMissingAfter';

    PERFORM 1 FROM instance_cluster.node FOR UPDATE;

    SELECT EXISTS (
        SELECT 1 FROM instance_cluster.node
        WHERE cluster_master
        AND date_check_in > EXTRACT(EPOCH FROM NOW())::BIGINT - missing_after
    ) INTO master_ok;

    IF master_ok THEN
        RETURN FALSE;
    END IF;

    UPDATE instance_cluster.node SET cluster_master = FALSE WHERE cluster_master;
    UPDATE instance_cluster.node SET cluster_master = TRUE WHERE id = requesting_node_id;

    INSERT INTO instance_cluster.node_event (node_id, content, payload)
    SELECT id, 'masterAssigned',
        JSON_BUILD_OBJECT('state', id = requesting_node_id)::TEXT
    FROM instance_cluster.node WHERE running;

    RETURN TRUE;
END;
$$ LANGUAGE plpgsql;

-- Trigger an out-of-band task run on the appropriate node set: the master
-- for master-only tasks, every running node otherwise.
CREATE FUNCTION instance_cluster.run_task(
    task_name TEXT,
    pg_function_id UUID DEFAULT NULL,
    pg_function_schedule_id UUID DEFAULT NULL)
RETURNS VOID AS $$
DECLARE
    master_only BOOLEAN := TRUE;
BEGIN
    IF task_name <> '' THEN
        SELECT cluster_master_only INTO master_only FROM instance.task WHERE name = task_name;
    END IF;

    INSERT INTO instance_cluster.node_event (node_id, content, payload)
    SELECT id, 'taskTriggered', JSON_BUILD_OBJECT(
        'taskName', task_name,
        'pgFunctionId', pg_function_id,
        'pgFunctionScheduleId', pg_function_schedule_id)::TEXT
    FROM instance_cluster.node
    WHERE running AND (NOT master_only OR cluster_master);
END;
$$ LANGUAGE plpgsql;
"#;

/// System task definitions and their schedule rows.
pub const BASELINE_TASKS: &str = r#"
INSERT INTO instance.task (name, interval_seconds, cluster_master_only, embedded_only, active_only, active) VALUES
    ('cleanupBruteforce',   86400, FALSE, FALSE, FALSE, TRUE),
    ('cleanupFiles',        86400, TRUE,  FALSE, FALSE, TRUE),
    ('cleanupLogs',         86400, TRUE,  FALSE, FALSE, TRUE),
    ('cleanupMailTraffic',  86400, TRUE,  FALSE, FALSE, TRUE),
    ('clusterCheckIn',         60, FALSE, FALSE, FALSE, TRUE),
    ('clusterProcessEvents',    5, FALSE, FALSE, FALSE, TRUE),
    ('mailSend',               15, TRUE,  FALSE, FALSE, TRUE),
    ('restCall',               15, TRUE,  FALSE, FALSE, TRUE),
    ('sessionsLog',            60, FALSE, FALSE, FALSE, TRUE),
    ('updateCheck',         86400, TRUE,  FALSE, FALSE, TRUE);

INSERT INTO instance.schedule (task_name, date_attempt, date_success)
SELECT name, 0, 0 FROM instance.task;
"#;
