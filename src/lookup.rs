//! 查询路径：corpus / document / text → 外部资源

use tracing::debug;

use crate::common::NOT_FOUND_BODY;
use crate::key::CompositeKey;
use crate::store::MappingStore;

/// 查询结果：命中时携带原样存储的字节
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Hit(Vec<u8>),
    Miss,
}

impl LookupOutcome {
    pub fn is_hit(&self) -> bool { matches!(self, Self::Hit(_)) }

    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Self::Hit(v) => Some(v.as_slice()),
            Self::Miss   => None,
        }
    }

    /// 渲染为 (HTTP 状态码, 响应体)；每种结果恰好对应一个响应
    pub fn into_response(self) -> (u16, Vec<u8>) {
        match self {
            Self::Hit(v) => (200, v),
            Self::Miss   => (404, NOT_FOUND_BODY.as_bytes().to_vec()),
        }
    }
}

/// 拼接组合键并点查；纯读操作，可任意并发调用
pub fn lookup(store: &MappingStore, corpus: &str, document: &str, text: &str) -> LookupOutcome {
    let key = match CompositeKey::new(corpus, document, text) {
        Ok(key) => key,
        Err(e) => {
            debug!(error = %e, "lookup with invalid segment");
            return LookupOutcome::Miss;
        }
    };
    match store.get(key.as_bytes()) {
        Some(v) => LookupOutcome::Hit(v),
        None    => LookupOutcome::Miss,
    }
}
