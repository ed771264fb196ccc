// スキーマサーバー（from側）
//
// パイプの反対側でコマンドに応答するレスポンダー。バージョン交渉に
// 応じ、正規化済みのローカルスキーマを交渉済み形式で返し、quitで
// 停止します。イントロスペクションは自前の読み取りトランザクション/
// スナップショットの中で行われます。

use tokio::io::{AsyncRead, AsyncWrite};

use crate::adapters::dialect::DialectAdapter;
use crate::core::error::{ProtocolError, SyncError};
use crate::core::protocol::{Command, ProtocolVersion};
use crate::services::wire::{encode_schema, CommandStream};

/// from側のコマンドレスポンダー
pub struct SchemaServer<R, W> {
    stream: CommandStream<R, W>,
    adapter: Box<dyn DialectAdapter>,
    version: Option<ProtocolVersion>,
    snapshot_held: bool,
}

impl<R, W> SchemaServer<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// ストリームとローカルDBアダプターからサーバーを作成
    pub fn new(stream: CommandStream<R, W>, adapter: Box<dyn DialectAdapter>) -> Self {
        Self {
            stream,
            adapter,
            version: None,
            snapshot_held: false,
        }
    }

    /// 交渉済みバージョン（交渉前はNone）
    pub fn version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    /// セッション全体を実行
    ///
    /// スナップショットを確立してからコマンドループに入り、quitまたは
    /// エラーで抜けます。スナップショットは成功・失敗を問わず一度だけ
    /// 解放されます。
    pub async fn serve(&mut self) -> Result<(), SyncError> {
        if let Err(error) = self.adapter.export_snapshot().await {
            // 相手を待たせたままにしないようストリームだけ閉じる
            let _ = self.stream.shutdown().await;
            return Err(error);
        }
        self.snapshot_held = true;

        let result = match self.serve_commands().await {
            Ok(()) => self.finish().await,
            Err(error) => Err(error),
        };

        match result {
            Ok(()) => Ok(()),
            Err(error) => {
                // 後始末は最善努力で行い、元の診断を覆い隠さない
                let _ = self.adapter.rollback_transaction().await;
                let _ = self.release_snapshot().await;
                let _ = self.stream.shutdown().await;
                Err(error)
            }
        }
    }

    async fn finish(&mut self) -> Result<(), SyncError> {
        self.adapter.commit_transaction().await?;
        self.release_snapshot().await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    async fn serve_commands(&mut self) -> Result<(), SyncError> {
        loop {
            match self.stream.read_command().await? {
                Command::Protocol { version } => self.answer_protocol(version).await?,
                Command::Schema => self.answer_schema().await?,
                Command::Idle => self.answer_idle().await?,
                Command::Quit => return Ok(()),
            }
        }
    }

    /// バージョン交渉に応答
    ///
    /// 相手の希望と自端の最新版のうち小さい方を応答します。結果が
    /// サポート範囲を下回る場合は応答後にセッションを終了します。
    async fn answer_protocol(&mut self, peer_version: i64) -> Result<(), SyncError> {
        match ProtocolVersion::agree_with(peer_version) {
            Ok(version) => {
                self.stream.send_frame(&version.value()).await?;
                self.version = Some(version);
                Ok(())
            }
            Err(error) => {
                // 相手が判断できるよう、拒否するバージョンをそのまま返す
                self.stream.send_frame(&peer_version).await?;
                Err(error.into())
            }
        }
    }

    async fn answer_schema(&mut self) -> Result<(), SyncError> {
        let version = self.negotiated_version("schema")?;

        let database = self.adapter.populate_schema().await?;
        let database = self.adapter.normalize_schema(database);
        let payload = encode_schema(&database, version)?;

        self.stream.send_frame(&payload).await?;
        Ok(())
    }

    async fn answer_idle(&mut self) -> Result<(), SyncError> {
        let version = self.negotiated_version("idle")?;
        if !version.supports_idle_command() {
            return Err(ProtocolError::UnexpectedCommand {
                command: "idle".to_string(),
                detail: format!("not supported by protocol version {}", version),
            }
            .into());
        }

        self.stream.send(&Command::Idle).await?;
        Ok(())
    }

    async fn release_snapshot(&mut self) -> Result<(), SyncError> {
        if self.snapshot_held {
            self.snapshot_held = false;
            self.adapter.unhold_snapshot().await?;
        }
        Ok(())
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
