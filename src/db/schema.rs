pub const SCHEMA_V1: &str = r#"
BEGIN;

-- Message:
-- created_at / sent_at / delivered_at хранятся в unix-миллисекундах.
-- media_urls - JSON-массив строк.
CREATE TABLE
    IF NOT EXISTS message (
        id BLOB PRIMARY KEY CHECK (length (id) = 16),
        conversation_id TEXT NOT NULL,
        from_number TEXT NOT NULL,
        to_number TEXT NOT NULL,
        body TEXT NOT NULL,
        direction INTEGER NOT NULL,
        status INTEGER NOT NULL,
        media_urls TEXT CHECK (
            media_urls IS NULL
            OR json_valid (media_urls)
        ),
        created_at INTEGER NOT NULL,
        sent_at INTEGER,
        delivered_at INTEGER
    );

CREATE INDEX IF NOT EXISTS idx_message_conversation
    ON message (conversation_id, created_at);

-- Conversation:
-- id - нормализованный номер собеседника.
CREATE TABLE
    IF NOT EXISTS conversation (
        id TEXT PRIMARY KEY,
        last_message TEXT NOT NULL DEFAULT '',
        last_message_time INTEGER NOT NULL DEFAULT 0,
        unread_count INTEGER NOT NULL DEFAULT 0,
        is_archived INTEGER NOT NULL DEFAULT 0,
        is_muted INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

-- Call:
-- call_type - терминальный тип для истории, duration в секундах.
CREATE TABLE
    IF NOT EXISTS call (
        id BLOB PRIMARY KEY CHECK (length (id) = 16),
        phone_number TEXT NOT NULL,
        direction INTEGER NOT NULL,
        call_type INTEGER NOT NULL,
        duration INTEGER NOT NULL DEFAULT 0,
        start_time INTEGER NOT NULL,
        end_time INTEGER,
        line_number INTEGER NOT NULL DEFAULT 0,
        notes TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

CREATE INDEX IF NOT EXISTS idx_call_number_start
    ON call (phone_number, start_time);

-- Contact:
-- is_favorite / is_blocked принадлежат только клиенту, сервер их не знает.
CREATE TABLE
    IF NOT EXISTS contact (
        phone_number TEXT PRIMARY KEY,
        first_name TEXT NOT NULL DEFAULT '',
        last_name TEXT NOT NULL DEFAULT '',
        email TEXT,
        picture_url TEXT,
        is_favorite INTEGER NOT NULL DEFAULT 0,
        is_blocked INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

------------------------------------------------------------------
PRAGMA user_version = 1;

COMMIT;
"#;

// Вторая версия: колонка signature и ограничение уникальности на неё.
// Бэкфилл для уже существующих строк берёт их собственный id, чтобы
// миграция не породила ложных коллизий.
pub const SCHEMA_V2: &str = r#"
BEGIN;

ALTER TABLE message ADD COLUMN signature TEXT;

UPDATE message
SET signature = lower (hex (id))
WHERE signature IS NULL;

CREATE UNIQUE INDEX IF NOT EXISTS idx_message_signature
    ON message (signature);

PRAGMA user_version = 2;

COMMIT;
"#;

