use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Absolute address of an instruction inside a procedure's instruction tree.
///
/// The procedure itself sits at the root (`/`); every instruction has at least
/// one segment. Displayed as `/a/b/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstructionPath {
    segments: Vec<String>,
}

impl InstructionPath {
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    pub fn from_segments<I, S>(segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Vec::new();
        for segment in segments {
            let segment = segment.into();
            validate_segment(&segment)?;
            out.push(segment);
        }
        Ok(Self { segments: out })
    }

    /// Parse `/a/b/` (leading and trailing slashes optional).
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "/" {
            return Ok(Self::root());
        }
        Self::from_segments(trimmed.trim_matches('/').split('/'))
    }

    pub fn child(&self, segment: impl Into<String>) -> Result<Self> {
        let segment = segment.into();
        validate_segment(&segment)?;
        let mut segments = self.segments.clone();
        segments.push(segment);
        Ok(Self { segments })
    }

    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }
}

fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(anyhow!("instruction path segment must not be empty"));
    }
    if segment == "." || segment == ".." {
        return Err(anyhow!("instruction path segment '{segment}' is not allowed"));
    }
    if segment.contains('/') || segment.contains('\\') {
        return Err(anyhow!(
            "instruction path segment '{segment}' must not contain path separators"
        ));
    }
    Ok(())
}

impl fmt::Display for InstructionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("/")?;
        for segment in &self.segments {
            write!(f, "{segment}/")?;
        }
        Ok(())
    }
}

impl TryFrom<String> for InstructionPath {
    type Error = anyhow::Error;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<InstructionPath> for String {
    fn from(path: InstructionPath) -> Self {
        path.to_string()
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Stable name of a condition or result an instruction prepares.
    ProductionId
);
string_id!(
    /// Name of an environment-provided resource.
    ResourceId
);

/// Address of one production: the instruction preparing it plus its name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductPath {
    pub instruction: InstructionPath,
    pub production: ProductionId,
}

impl ProductPath {
    pub fn new(instruction: InstructionPath, production: impl Into<ProductionId>) -> Self {
        Self {
            instruction,
            production: production.into(),
        }
    }
}

impl fmt::Display for ProductPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.instruction, self.production)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    Condition,
    Result,
}

impl fmt::Display for DependencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKind::Condition => f.write_str("condition"),
            DependencyKind::Result => f.write_str("result"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_trailing_slashes() {
        let path = InstructionPath::parse("/a/b").unwrap();
        assert_eq!(path.to_string(), "/a/b/");
        assert_eq!(InstructionPath::root().to_string(), "/");
        assert_eq!(
            ProductPath::new(path, "out").to_string(),
            "/a/b/out",
            "product paths append the production name"
        );
    }

    #[test]
    fn parent_walks_towards_root() {
        let path = InstructionPath::parse("/a/b/").unwrap();
        let parent = path.parent().unwrap();
        assert_eq!(parent, InstructionPath::parse("a").unwrap());
        assert!(parent.parent().unwrap().is_root());
        assert!(InstructionPath::root().parent().is_none());
    }

    #[test]
    fn rejects_traversal_segments() {
        let err = InstructionPath::parse("/a/../b").unwrap_err();
        assert!(err.to_string().contains("'..'"), "{err:#}");
        let err = InstructionPath::parse("/a//b").unwrap_err();
        assert!(err.to_string().contains("empty"), "{err:#}");
    }

    #[test]
    fn serde_uses_display_form() {
        let path = InstructionPath::parse("/x/y/").unwrap();
        let yaml = serde_yaml::to_string(&path).unwrap();
        assert_eq!(yaml.trim(), "/x/y/");
        let back: InstructionPath = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, path);
    }
}
