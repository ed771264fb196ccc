// プロトコルバージョンとワイヤーコマンド
//
// エンドポイント間のハンドシェイクで使用するプロトコルバージョンの
// 定義と、フレーム化されるコマンドの型を提供します。バージョンで
// 切り替わる挙動はすべて、交渉済みの単一の値（ProtocolVersion）の
// 純粋な関数として表現します。

use serde::{Deserialize, Serialize};

use crate::core::error::ProtocolError;

/// サポートする最古のプロトコルバージョン
pub const EARLIEST_PROTOCOL_VERSION_SUPPORTED: i64 = 7;

/// サポートする最新のプロトコルバージョン
pub const LATEST_PROTOCOL_VERSION_SUPPORTED: i64 = 9;

/// レガシースキーマシリアライズ形式を使う最後のバージョン
pub const LAST_LEGACY_SCHEMA_FORMAT_VERSION: i64 = 7;

/// idleキープアライブコマンドが使える最初のバージョン
pub const FIRST_IDLE_COMMAND_VERSION: i64 = 8;

/// 行ハッシュアルゴリズムがBLAKE3に切り替わる最初のバージョン
///
/// ハッシュ処理自体は後続のデータ同期エンジンの仕事ですが、正しい
/// アルゴリズムが選択されるようにバージョンの広告/受理はここで行います。
pub const FIRST_BLAKE3_VERSION: i64 = 9;

/// 交渉済みプロトコルバージョン
///
/// `negotiate` を通してのみ構築されるため、保持している値は常に
/// サポート範囲内にあります。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(i64);

impl ProtocolVersion {
    /// 相手が報告したバージョンを検証して受け入れる
    ///
    /// サポート範囲 [EARLIEST, LATEST]（両端を含む）の外であれば
    /// `UnsupportedVersion` で失敗します。
    pub fn negotiate(value: i64) -> Result<Self, ProtocolError> {
        if (EARLIEST_PROTOCOL_VERSION_SUPPORTED..=LATEST_PROTOCOL_VERSION_SUPPORTED)
            .contains(&value)
        {
            Ok(Self(value))
        } else {
            Err(ProtocolError::UnsupportedVersion { version: value })
        }
    }

    /// 自端と相手の希望から合意バージョンを計算する
    ///
    /// 受信側は相手の希望と自分の最新版のうち小さい方で応答します。
    pub fn agree_with(peer_requested: i64) -> Result<Self, ProtocolError> {
        Self::negotiate(peer_requested.min(LATEST_PROTOCOL_VERSION_SUPPORTED))
    }

    /// バージョン値を取得
    pub fn value(self) -> i64 {
        self.0
    }

    /// レガシースキーマ形式（テーブル配列のみ）を使うかどうか
    pub fn uses_legacy_schema_format(self) -> bool {
        self.0 <= LAST_LEGACY_SCHEMA_FORMAT_VERSION
    }

    /// idleキープアライブコマンドが使えるかどうか
    pub fn supports_idle_command(self) -> bool {
        self.0 >= FIRST_IDLE_COMMAND_VERSION
    }

    /// 後続のデータ同期でBLAKE3行ハッシュを使うかどうか
    pub fn uses_blake3_hash(self) -> bool {
        self.0 >= FIRST_BLAKE3_VERSION
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ワイヤーコマンド
///
/// バイトストリームパイプ上でフレーム化されるコマンド。厳密な
/// リクエスト/レスポンスで、同時に送信中のコマンドは常に一つです。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verb", rename_all = "lowercase")]
pub enum Command {
    /// バージョン交渉
    Protocol {
        /// 送信側がサポートする上限バージョン
        version: i64,
    },

    /// スキーマ要求（応答はシリアライズされたDatabase）
    Schema,

    /// キープアライブ（バージョン8以降）
    Idle,

    /// セッション終了
    Quit,
}

impl Command {
    /// コマンド名を取得（診断メッセージ用）
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Protocol { .. } => "protocol",
            Command::Schema => "schema",
            Command::Idle => "idle",
            Command::Quit => "quit",
        }
    }
}
