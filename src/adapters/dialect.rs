// ダイアレクトアダプター契約
//
// エンジンごとのドライバーが実装する固定契約。ライブカタログから
// スキーマモデルを構築し、比較の前にローカルエンジンの能力部分集合へ
// 正規化します。スナップショットはセッション開始時に一度だけ確立
// （または参加）され、成功・失敗を問わず終了時に一度だけ解放されます。

use async_trait::async_trait;

use crate::adapters::connection::ConnectionService;
use crate::adapters::mysql::MySqlAdapter;
use crate::adapters::postgres::PostgresAdapter;
use crate::core::config::{DatabaseConfig, Dialect};
use crate::core::error::SyncError;
use crate::core::schema::{Database, PrimaryKeyType, Table};

/// データベースエンジンアダプター
///
/// 同期セッションはこの契約だけを通してエンジンと対話します。
#[async_trait]
pub trait DialectAdapter: Send {
    /// このアダプターの方言
    fn dialect(&self) -> Dialect;

    /// ライブカタログからスキーマを構築
    ///
    /// テーブルを発見し、各テーブルについて物理的な宣言順のカラム、
    /// 序数順の明示的プライマリキー、キー名→キー内位置の順で
    /// セカンダリキーを取得します。キーは決定性のため (key_type, name)
    /// でソートしてから返します。認識できないネイティブ型は失敗では
    /// なく UNKNOWN として取り込まれます。
    async fn populate_schema(&mut self) -> Result<Database, SyncError>;

    /// スキーマをローカルエンジンの能力部分集合へ書き換え
    ///
    /// 比較の**前**に実行されるため、エンジン由来の正当な差異
    /// （符号なし整数の拡張、サイズ区別の無いエンジンでのサイズの
    /// 折り畳み、識別子長の切り詰めなど）は不一致として検出されません。
    fn normalize_schema(&self, database: Database) -> Database;

    /// トランザクション一貫スナップショットを確立してトークンを返す
    async fn export_snapshot(&mut self) -> Result<String, SyncError>;

    /// ピアが確立したスナップショットに参加する
    async fn import_snapshot(&mut self, snapshot: &str) -> Result<(), SyncError>;

    /// スナップショットの保持を解除する（ロックベースのエンジン用）
    async fn unhold_snapshot(&mut self) -> Result<(), SyncError>;

    /// セッションのトランザクションをコミットする
    async fn commit_transaction(&mut self) -> Result<(), SyncError>;

    /// セッションのトランザクションをロールバックする
    async fn rollback_transaction(&mut self) -> Result<(), SyncError>;
}

/// 方言に応じたアダプターを作成して接続
pub async fn create_adapter(
    dialect: Dialect,
    config: &DatabaseConfig,
) -> Result<Box<dyn DialectAdapter>, SyncError> {
    let connection = ConnectionService::new().connect(dialect, config).await?;

    Ok(match dialect {
        Dialect::PostgreSQL => Box::new(PostgresAdapter::new(connection)),
        Dialect::MySQL => Box::new(MySqlAdapter::new(connection)),
    })
}

/// プライマリキーを持たないテーブルに代替キーを昇格させる
///
/// 明示的なプライマリキーが無い場合、NULL許可カラムを含まない
/// 最初のユニークキー（ソート順）を代替プライマリキーとして使います。
/// NULL許可カラムはインデックスを実質的に非ユニークにするため対象外
/// です。昇格はローカルな便宜であり、スキーマ比較には寄与しません。
pub(crate) fn promote_surrogate_primary_key(table: &mut Table) {
    if table.primary_key_type != PrimaryKeyType::NoAvailableKey {
        return;
    }

    let suitable = table.keys.iter().find(|key| {
        key.unique()
            && !key.columns.is_empty()
            && key.columns.iter().all(|&index| {
                table
                    .columns
                    .get(index)
                    .map(|column| !column.nullable)
                    .unwrap_or(false)
            })
    });

    if let Some(key) = suitable {
        table.primary_key_columns = key.columns.clone();
        table.primary_key_type = PrimaryKeyType::SuitableUniqueKey;
    }
}
