use std::sync::Arc;

use anyhow::{Context, Result};
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::util::text::take_chars;

/// トークン数を計算するためのカウンタ。
///
/// HuggingFaceトークナイザーが利用可能な場合はそれを使用し、
/// 利用できない場合は「約4文字=1トークン」のヒューリスティックに
/// フォールバックします。
#[derive(Debug, Clone)]
pub(crate) struct TokenCounter {
    tokenizer: Option<Arc<Tokenizer>>,
}

impl TokenCounter {
    /// 指定されたモデルのトークナイザーをHuggingFaceからロードする。
    ///
    /// 注意: 初回実行時にダウンロードが発生するため、インターネット接続が必要。
    pub(crate) fn from_pretrained(model: &str) -> Result<Self> {
        info!(model, "initializing token counter");
        let tokenizer = Tokenizer::from_pretrained(model, None)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer for {model}: {e}"))
            .context("tokenizer initialization failed")?;
        Ok(Self {
            tokenizer: Some(Arc::new(tokenizer)),
        })
    }

    /// ヒューリスティックのみのカウンタを作成する（トークナイザーなし）。
    ///
    /// テスト用および、本番環境で初期化に失敗した場合のフォールバック。
    pub(crate) fn dummy() -> Self {
        Self { tokenizer: None }
    }

    /// テキストのトークン数を計算する。
    pub(crate) fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        if let Some(tokenizer) = &self.tokenizer {
            match tokenizer.encode(text, false) {
                Ok(encoding) => return encoding.len(),
                Err(e) => {
                    warn!("failed to encode text for token counting: {e}");
                }
            }
        }
        // ヒューリスティック: 約4文字 = 1トークン
        text.chars().count().div_ceil(4).max(1)
    }

    /// テキストを概算で`max_tokens`以内に収まるよう切り詰める。
    ///
    /// トークン数から比例的に文字長を見積もって先頭から切り出す。
    /// `max_tokens <= 0`相当（0）の場合は切り詰めない。
    pub(crate) fn trim_to_tokens(&self, text: &str, max_tokens: usize) -> String {
        if max_tokens == 0 {
            return text.to_string();
        }
        let tokens = self.count(text);
        if tokens <= max_tokens {
            return text.to_string();
        }
        let ratio = (max_tokens as f64 / tokens as f64).max(0.05);
        let chars = text.chars().count();
        let est_len = ((chars as f64) * ratio).floor().max(1.0) as usize;
        take_chars(text, est_len).to_string()
    }
}
