//! 组合键与 value 的拼接规则

use crate::common::{MappingError, Result, KEY_DELIMITER, VALUE_SEPARATOR};

/// `corpus/document/text` 组合键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompositeKey(String);

impl CompositeKey {
    /// 由三段标识构造；任一段含有分隔符时返回 InvalidSegment
    pub fn new(corpus: &str, document: &str, text: &str) -> Result<Self> {
        for seg in [corpus, document, text] {
            if seg.contains(KEY_DELIMITER) {
                return Err(MappingError::InvalidSegment(seg.into()));
            }
        }
        Ok(Self(format!("{corpus}{KEY_DELIMITER}{document}{KEY_DELIMITER}{text}")))
    }

    /// 导入文件中已拼好的键，原样使用
    pub fn from_raw(raw: &str) -> Self { Self(raw.into()) }

    pub fn as_str(&self)   -> &str  { &self.0 }
    pub fn as_bytes(&self) -> &[u8] { self.0.as_bytes() }
}

impl std::fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// value 各列以逗号拼接：`provider,url`
pub fn join_value<'a>(fields: impl IntoIterator<Item = &'a str>) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, f) in fields.into_iter().enumerate() {
        if i > 0 {
            out.push(VALUE_SEPARATOR as u8);
        }
        out.extend_from_slice(f.as_bytes());
    }
    out
}
