// 同期オーケストレーター（to側）
//
// ハンドシェイクを進行する状態機械。バージョン交渉 → スキーマ交換 →
// 構造比較の順に進み、いずれかが失敗するとセッション全体を中断します。
// 厳密なリクエスト/レスポンスで、パイプライン化や途中キャンセルは
// 行いません。エンドポイントごとに1インスタンスです。

use tokio::io::{AsyncRead, AsyncWrite};

use crate::adapters::dialect::DialectAdapter;
use crate::core::config::TableFilters;
use crate::core::error::{ProtocolError, SyncError};
use crate::core::protocol::{Command, ProtocolVersion, LATEST_PROTOCOL_VERSION_SUPPORTED};
use crate::core::schema::Database;
use crate::core::schema_match::check_schema_match;
use crate::services::wire::{decode_schema, CommandStream};

/// セッションの進行状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// 開始前
    Start,
    /// バージョン交渉済み
    VersionNegotiated,
    /// スキーマ交換済み
    SchemaExchanged,
    /// 構造比較に合格
    Matched,
    /// データ同期を開始できる状態（正常終了）
    Ready,
    /// 中断（終端状態）
    Aborted,
}

/// セッション開始時のスナップショットの役割
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotRole {
    /// 自端でスナップショットを確立する
    Establish,
    /// ピアが確立したスナップショットに参加する
    Join(String),
}

/// to側のハンドシェイク進行役
pub struct SyncOrchestrator<R, W> {
    stream: CommandStream<R, W>,
    adapter: Box<dyn DialectAdapter>,
    filters: TableFilters,
    state: SyncState,
    version: Option<ProtocolVersion>,
    snapshot_held: bool,
}

impl<R, W> SyncOrchestrator<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// ストリームとローカルDBアダプターからオーケストレーターを作成
    pub fn new(
        stream: CommandStream<R, W>,
        adapter: Box<dyn DialectAdapter>,
        filters: TableFilters,
    ) -> Self {
        Self {
            stream,
            adapter,
            filters,
            state: SyncState::Start,
            version: None,
            snapshot_held: false,
        }
    }

    /// 現在の進行状態
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// 交渉済みバージョン（交渉前はNone）
    pub fn version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    /// セッション全体を実行
    ///
    /// 成功時はコミットとquitで正常終了し、失敗時はロールバックと
    /// quitで中断して元のエラーを返します。スナップショットは成功・
    /// 失敗を問わず一度だけ解放されます。
    pub async fn run(&mut self, role: SnapshotRole) -> Result<(), SyncError> {
        let result = match self.handshake(role).await {
            Ok(()) => self.finish().await,
            Err(error) => Err(error),
        };

        // 後始末（コミットやquit送信）の失敗も中断として扱い、
        // スナップショットを保持したままにしない
        match result {
            Ok(()) => Ok(()),
            Err(error) => {
                self.abort().await;
                Err(error)
            }
        }
    }

    async fn handshake(&mut self, role: SnapshotRole) -> Result<(), SyncError> {
        self.acquire_snapshot(role).await?;
        self.negotiate_version().await?;
        let (from_database, to_database) = self.exchange_schemas().await?;
        self.check_match(&from_database, &to_database)?;
        Ok(())
    }

    /// バージョン交渉
    ///
    /// 自端の最新版を提示し、相手が応答したバージョンを検証します。
    /// サポート範囲外であれば、スキーマコマンドを送る**前に**失敗します。
    pub async fn negotiate_version(&mut self) -> Result<ProtocolVersion, SyncError> {
        self.stream
            .send(&Command::Protocol {
                version: LATEST_PROTOCOL_VERSION_SUPPORTED,
            })
            .await?;

        let reply: i64 = self.stream.read_frame().await?;
        let version = ProtocolVersion::negotiate(reply)?;

        self.version = Some(version);
        self.state = SyncState::VersionNegotiated;
        Ok(version)
    }

    /// スキーマ交換
    ///
    /// 相手のスキーマを交渉済み形式で受信し、ローカルスキーマを
    /// イントロスペクションします。どちらもローカルエンジンの能力
    /// 部分集合へ正規化してから返します。
    pub async fn exchange_schemas(&mut self) -> Result<(Database, Database), SyncError> {
        let version = self.negotiated_version("schema")?;

        self.stream.send(&Command::Schema).await?;
        let payload: serde_json::Value = self.stream.read_frame().await?;
        let from_database = decode_schema(payload, version)?;

        let to_database = self.adapter.populate_schema().await?;
        let to_database = self.adapter.normalize_schema(to_database);
        // 相手側のスキーマもローカルエンジンで表現できる形に落としてから
        // 比較する。エンジン由来の正当な差異を不一致にしないため
        let from_database = self.adapter.normalize_schema(from_database);

        self.state = SyncState::SchemaExchanged;
        Ok((from_database, to_database))
    }

    /// 構造比較
    pub fn check_match(
        &mut self,
        from_database: &Database,
        to_database: &Database,
    ) -> Result<(), SyncError> {
        check_schema_match(from_database, to_database, &self.filters)?;
        self.state = SyncState::Matched;
        Ok(())
    }

    /// キープアライブ
    ///
    /// 交渉済みバージョンがidleをサポートする場合のみ送信し、エコーを
    /// 確認します。v7に対しては何もしません。
    pub async fn keep_alive(&mut self) -> Result<(), SyncError> {
        let version = self.negotiated_version("idle")?;
        if !version.supports_idle_command() {
            return Ok(());
        }

        self.stream.send(&Command::Idle).await?;
        let reply = self.stream.read_command().await?;
        if reply != Command::Idle {
            return Err(ProtocolError::UnexpectedReply {
                command: "idle".to_string(),
                detail: format!("got '{}'", reply.verb()),
            }
            .into());
        }
        Ok(())
    }

    async fn acquire_snapshot(&mut self, role: SnapshotRole) -> Result<(), SyncError> {
        match role {
            SnapshotRole::Establish => {
                self.adapter.export_snapshot().await?;
            }
            SnapshotRole::Join(token) => {
                self.adapter.import_snapshot(&token).await?;
            }
        }
        self.snapshot_held = true;
        Ok(())
    }

    async fn release_snapshot(&mut self) -> Result<(), SyncError> {
        if self.snapshot_held {
            self.snapshot_held = false;
            self.adapter.unhold_snapshot().await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SyncError> {
        self.adapter.commit_transaction().await?;
        self.release_snapshot().await?;
        self.stream.send(&Command::Quit).await?;
        self.stream.shutdown().await?;
        self.state = SyncState::Ready;
        Ok(())
    }

    async fn abort(&mut self) {
        // 中断時の後始末は最善努力で行い、元の診断を覆い隠さない
        let _ = self.adapter.rollback_transaction().await;
        let _ = self.release_snapshot().await;
        let _ = self.stream.send(&Command::Quit).await;
        let _ = self.stream.shutdown().await;
        self.state = SyncState::Aborted;
    }

    fn negotiated_version(&self, command: &str) -> Result<ProtocolVersion, SyncError> {
        self.version.ok_or_else(|| {
            ProtocolError::UnexpectedCommand {
                command: command.to_string(),
                detail: "version not negotiated yet".to_string(),
            }
            .into()
        })
    }
}
