// エラー型定義
//
// 同期セッション全体で使用されるカスタムエラー型を提供します。
// thiserrorを使用して、SchemaMismatch, ProtocolError, DatabaseError と
// それらを集約する SyncError を定義します。
//
// このコアでの致命的エラーはすべてセッションを終了させます。部分的な
// リトライや局所的な回復は行いません。

use thiserror::Error;

use crate::core::protocol::{
    EARLIEST_PROTOCOL_VERSION_SUPPORTED, LATEST_PROTOCOL_VERSION_SUPPORTED,
};

/// スキーマ不一致エラー
///
/// 構造的な不一致（テーブル/カラム/キーの欠落・余剰・順序違い、
/// キー種別や明示的プライマリキーの相違）を表現します。常に致命的で、
/// 再試行されません。診断メッセージは最初に検出された不一致のみを、
/// テーブル名・対象の種類・名前・期待された内容とともに記述します。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SchemaMismatch {
    /// 人間が読める診断メッセージ
    pub message: String,
}

impl SchemaMismatch {
    /// 新しいスキーマ不一致エラーを作成
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// プロトコルエラー
///
/// ハンドシェイク中のバージョン交渉やフレーム入出力の失敗を表現します。
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Unsupported protocol version
    #[error("Unsupported protocol version {version} (supported versions are {} to {})",
            EARLIEST_PROTOCOL_VERSION_SUPPORTED, LATEST_PROTOCOL_VERSION_SUPPORTED)]
    UnsupportedVersion {
        /// 相手が報告したバージョン
        version: i64,
    },

    /// Unexpected reply to a command
    #[error("Unexpected reply to '{command}' command: {detail}")]
    UnexpectedReply {
        /// 送信したコマンド名
        command: String,
        /// 不正だった内容
        detail: String,
    },

    /// Command received out of order
    #[error("Unexpected '{command}' command: {detail}")]
    UnexpectedCommand {
        /// 受信したコマンド名
        command: String,
        /// 不正だった理由
        detail: String,
    },

    /// Stream I/O error
    #[error("Stream error: {0}")]
    Stream(#[from] std::io::Error),

    /// Frame encode/decode error
    #[error("Malformed frame: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ProtocolError {
    /// バージョン非対応エラーかどうか
    pub fn is_unsupported_version(&self) -> bool {
        matches!(self, ProtocolError::UnsupportedVersion { .. })
    }

    /// ストリームエラーかどうか
    pub fn is_stream(&self) -> bool {
        matches!(self, ProtocolError::Stream(_))
    }
}

/// データベースエラー
///
/// ドライバー/イントロスペクション操作時に発生するエラーを表現します。
/// 未知のネイティブ型はこのエラーには**なりません**。UNKNOWN型として
/// 元の型文字列とともにスキーマへ取り込まれ、拒否はそのカラムが実際に
/// 必要になる時点まで遅延されます。
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection error
    #[error("Database connection error: {message} (cause: {cause})")]
    Connection {
        /// エラーメッセージ
        message: String,
        /// エラー原因
        cause: String,
    },

    /// Query execution error
    #[error("Query execution error: {message}")]
    Query {
        /// エラーメッセージ
        message: String,
        /// 失敗したSQL
        sql: Option<String>,
    },

    /// Transaction error
    #[error("Transaction error: {message}")]
    Transaction {
        /// エラーメッセージ
        message: String,
    },

    /// Snapshot error
    #[error("Snapshot error: {message}")]
    Snapshot {
        /// エラーメッセージ
        message: String,
    },
}

impl DatabaseError {
    /// 接続エラーかどうか
    pub fn is_connection(&self) -> bool {
        matches!(self, DatabaseError::Connection { .. })
    }

    /// クエリエラーかどうか
    pub fn is_query(&self) -> bool {
        matches!(self, DatabaseError::Query { .. })
    }

    /// トランザクションエラーかどうか
    pub fn is_transaction(&self) -> bool {
        matches!(self, DatabaseError::Transaction { .. })
    }

    /// スナップショットエラーかどうか
    pub fn is_snapshot(&self) -> bool {
        matches!(self, DatabaseError::Snapshot { .. })
    }

    /// sqlxのエラーからクエリエラーを作成
    pub fn from_query(error: sqlx::Error, sql: &str) -> Self {
        DatabaseError::Query {
            message: error.to_string(),
            sql: Some(sql.to_string()),
        }
    }
}

/// 同期セッションエラー
///
/// このクレートの操作が返すエラーの集約型。
#[derive(Debug, Error)]
pub enum SyncError {
    /// スキーマ不一致
    #[error(transparent)]
    SchemaMismatch(#[from] SchemaMismatch),

    /// プロトコルエラー
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// データベースエラー
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// カラムが見つからない
    #[error("Column {column} not found on table {table}")]
    ColumnNotFound {
        /// テーブル名
        table: String,
        /// カラム名
        column: String,
    },
}

impl SyncError {
    /// スキーマ不一致エラーかどうか
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, SyncError::SchemaMismatch(_))
    }

    /// バージョン非対応エラーかどうか
    pub fn is_unsupported_protocol(&self) -> bool {
        matches!(
            self,
            SyncError::Protocol(ProtocolError::UnsupportedVersion { .. })
        )
    }
}
