//! Logical axis tags and the ordered axis forms tensors are declared with.
//!
//! Image buffers always use the native order width, height, channel, depth,
//! batch. Model tensors declare their own order through an [`AxisForm`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{TilingError, TilingResult};

/// Maximum number of logical axes a tensor may carry.
pub const MAX_RANK: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisTag {
    Width,
    Height,
    Channel,
    Depth,
    Batch,
}

impl AxisTag {
    /// All tags in native buffer order.
    pub const NATIVE: [AxisTag; MAX_RANK] = [
        AxisTag::Width,
        AxisTag::Height,
        AxisTag::Channel,
        AxisTag::Depth,
        AxisTag::Batch,
    ];

    /// Axes the tile grid walks over. Channel and batch are never tiled.
    pub const SPATIAL: [AxisTag; 3] = [AxisTag::Width, AxisTag::Height, AxisTag::Depth];

    /// Position of this axis in a native `[x, y, c, z, b]` buffer.
    pub fn native_index(self) -> usize {
        match self {
            Self::Width => 0,
            Self::Height => 1,
            Self::Channel => 2,
            Self::Depth => 3,
            Self::Batch => 4,
        }
    }

    /// Position of this axis in `[x, y, z]` spatial triples, if spatial.
    pub fn spatial_index(self) -> Option<usize> {
        match self {
            Self::Width => Some(0),
            Self::Height => Some(1),
            Self::Depth => Some(2),
            Self::Channel | Self::Batch => None,
        }
    }

    /// Parse a single tag letter. Accepts both `NWHCD` and `BXYCZ` alphabets.
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_lowercase() {
            'b' | 'n' => Some(Self::Batch),
            'x' | 'w' => Some(Self::Width),
            'y' | 'h' => Some(Self::Height),
            'c' => Some(Self::Channel),
            'z' | 'd' => Some(Self::Depth),
            _ => None,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Self::Batch => 'b',
            Self::Width => 'x',
            Self::Height => 'y',
            Self::Channel => 'c',
            Self::Depth => 'z',
        }
    }
}

impl fmt::Display for AxisTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Ordered list of distinct axis tags, one per tensor dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AxisForm {
    tags: Vec<AxisTag>,
}

impl AxisForm {
    pub fn parse(form: &str) -> TilingResult<Self> {
        let form = form.trim();
        let letters: Vec<char> = form.chars().collect();
        if letters.is_empty() {
            return Err(TilingError::InvalidAxisForm {
                form: form.to_string(),
                reason: "axis form is empty".to_string(),
            });
        }
        if letters.len() > MAX_RANK {
            return Err(TilingError::UnsupportedRank {
                tensor: form.to_string(),
                rank: letters.len(),
            });
        }

        let mut tags = Vec::with_capacity(letters.len());
        for letter in letters {
            let tag = AxisTag::from_letter(letter).ok_or_else(|| TilingError::InvalidAxisForm {
                form: form.to_string(),
                reason: format!("unknown axis letter '{letter}'"),
            })?;
            if tags.contains(&tag) {
                return Err(TilingError::InvalidAxisForm {
                    form: form.to_string(),
                    reason: format!("axis '{tag}' appears more than once"),
                });
            }
            tags.push(tag);
        }
        Ok(Self { tags })
    }

    pub fn from_tags(tags: &[AxisTag]) -> TilingResult<Self> {
        let text: String = tags.iter().map(|t| t.letter()).collect();
        Self::parse(&text)
    }

    /// The native `xyczb` order image buffers are stored in.
    pub fn native() -> Self {
        Self {
            tags: AxisTag::NATIVE.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn tags(&self) -> &[AxisTag] {
        &self.tags
    }

    pub fn iter(&self) -> impl Iterator<Item = AxisTag> + '_ {
        self.tags.iter().copied()
    }

    pub fn position(&self, tag: AxisTag) -> Option<usize> {
        self.tags.iter().position(|t| *t == tag)
    }

    pub fn contains(&self, tag: AxisTag) -> bool {
        self.position(tag).is_some()
    }

    /// Number of axes other than batch.
    pub fn working_rank(&self) -> usize {
        self.tags.iter().filter(|t| **t != AxisTag::Batch).count()
    }

    /// For each axis of `other`, the position of the same tag in `self`.
    ///
    /// Returns `None` when `other` names an axis this form lacks.
    pub fn permutation_to(&self, other: &AxisForm) -> Option<Vec<usize>> {
        other.iter().map(|tag| self.position(tag)).collect()
    }
}

impl fmt::Display for AxisForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for tag in &self.tags {
            write!(f, "{tag}")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for AxisForm {
    type Error = TilingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AxisForm> for String {
    fn from(value: AxisForm) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_alphabets() {
        let nhwc = AxisForm::parse("NHWC").unwrap();
        let byxc = AxisForm::parse("byxc").unwrap();
        assert_eq!(nhwc, byxc);
        assert_eq!(nhwc.to_string(), "byxc");
        assert_eq!(nhwc.position(AxisTag::Width), Some(2));
        assert_eq!(nhwc.working_rank(), 3);
    }

    #[test]
    fn rejects_repeated_and_unknown_axes() {
        assert!(matches!(
            AxisForm::parse("bxxc"),
            Err(TilingError::InvalidAxisForm { .. })
        ));
        assert!(matches!(
            AxisForm::parse("bxyt"),
            Err(TilingError::InvalidAxisForm { .. })
        ));
        assert!(matches!(
            AxisForm::parse(""),
            Err(TilingError::InvalidAxisForm { .. })
        ));
    }

    #[test]
    fn rejects_more_than_five_axes() {
        assert!(matches!(
            AxisForm::parse("bxyczx"),
            Err(TilingError::UnsupportedRank { rank: 6, .. })
        ));
    }

    #[test]
    fn permutation_maps_between_orders() {
        let bcyx = AxisForm::parse("bcyx").unwrap();
        let native = AxisForm::parse("xycb").unwrap();
        assert_eq!(bcyx.permutation_to(&native), Some(vec![3, 2, 1, 0]));

        let without_depth = AxisForm::parse("xy").unwrap();
        assert_eq!(without_depth.permutation_to(&AxisForm::native()), None);
    }

    #[test]
    fn serde_uses_string_form() {
        let form = AxisForm::parse("bzyxc").unwrap();
        let json = serde_json::to_string(&form).unwrap();
        assert_eq!(json, "\"bzyxc\"");
        let back: AxisForm = serde_json::from_str(&json).unwrap();
        assert_eq!(back, form);
        assert!(serde_json::from_str::<AxisForm>("\"bxx\"").is_err());
    }
}
