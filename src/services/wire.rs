// ワイヤーフレーミング
//
// バイトストリームパイプ上の改行区切りJSONフレームを提供します。
// コマンドも応答ペイロードも1行1フレームで、厳密なリクエスト/
// レスポンスのため同時に送信中のフレームは常に一つです。

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::core::error::ProtocolError;
use crate::core::protocol::{Command, ProtocolVersion};
use crate::core::schema::Database;

/// フレーム化されたコマンドストリーム
///
/// 任意の `AsyncRead`/`AsyncWrite` ペアの上で動作します。実運用では
/// 標準入出力パイプ、テストではインメモリのduplexパイプを使います。
pub struct CommandStream<R, W> {
    reader: BufReader<R>,
    writer: W,
}

impl<R, W> CommandStream<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// 読み書きのペアからストリームを作成
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// コマンドを1フレームとして送信
    pub async fn send(&mut self, command: &Command) -> Result<(), ProtocolError> {
        self.send_frame(command).await
    }

    /// 任意のシリアライズ可能な値を1フレームとして送信
    pub async fn send_frame<T: Serialize>(&mut self, payload: &T) -> Result<(), ProtocolError> {
        let mut line = serde_json::to_vec(payload)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// 次のフレームをコマンドとして読み取る
    pub async fn read_command(&mut self) -> Result<Command, ProtocolError> {
        self.read_frame().await
    }

    /// 次のフレームを指定の型として読み取る
    pub async fn read_frame<T: DeserializeOwned>(&mut self) -> Result<T, ProtocolError> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            // 相手がquitなしで接続を閉じた
            return Err(ProtocolError::Stream(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed the stream",
            )));
        }

        Ok(serde_json::from_str(line.trim_end())?)
    }

    /// 書き込み側を閉じてセッションを終了
    pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// スキーマ応答ペイロードを交渉済みバージョンの形式でエンコード
///
/// バージョン7まではテーブル配列のみを送るレガシー形式、8以降は
/// Databaseオブジェクト全体を送ります。
pub fn encode_schema(
    database: &Database,
    version: ProtocolVersion,
) -> Result<serde_json::Value, ProtocolError> {
    let value = if version.uses_legacy_schema_format() {
        serde_json::to_value(&database.tables)?
    } else {
        serde_json::to_value(database)?
    };
    Ok(value)
}

/// スキーマ応答ペイロードを交渉済みバージョンの形式でデコード
pub fn decode_schema(
    value: serde_json::Value,
    version: ProtocolVersion,
) -> Result<Database, ProtocolError> {
    if version.uses_legacy_schema_format() {
        let tables = serde_json::from_value(value)?;
        Ok(Database { tables })
    } else {
        Ok(serde_json::from_value(value)?)
    }
}
