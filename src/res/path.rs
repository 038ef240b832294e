//! Resource paths: an ordered sequence of `(type, id)` pairs such as
//! `sys0.cpu1.pe3`, canonically comparable and serializable to dotted
//! strings.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, RtrmError};

/// Closed, ordered enumeration of resource types. Order matters: a valid
/// path is strictly descending in this ordering and each type appears at
/// most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    System,
    Cpu,
    Gpu,
    Accelerator,
    Memory,
    ProcElement,
    Network,
}

impl ResourceType {
    fn tag(self) -> &'static str {
        match self {
            ResourceType::System => "sys",
            ResourceType::Cpu => "cpu",
            ResourceType::Gpu => "gpu",
            ResourceType::Accelerator => "acc",
            ResourceType::Memory => "mem",
            ResourceType::ProcElement => "pe",
            ResourceType::Network => "net",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "sys" => ResourceType::System,
            "cpu" => ResourceType::Cpu,
            "gpu" => ResourceType::Gpu,
            "acc" => ResourceType::Accelerator,
            "mem" => ResourceType::Memory,
            "pe" => ResourceType::ProcElement,
            "net" => ResourceType::Network,
            _ => return None,
        })
    }
}

/// A resource id. `Any` is a template wildcard used for matching; `None` marks
/// an explicitly unset position. `Id(n)` is a concrete identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceId {
    Id(u32),
    Any,
    None,
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Id(n) => write!(f, "{n}"),
            ResourceId::Any => write!(f, "ANY"),
            ResourceId::None => write!(f, "NONE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathSegment {
    pub kind: ResourceType,
    pub id: ResourceId,
}

/// An ordered, strictly-descending-by-type sequence of path segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourcePath {
    segments: Vec<PathSegment>,
}

impl ResourcePath {
    /// Build a path from segments, validating the descending-type invariant.
    pub fn new(segments: Vec<PathSegment>) -> Result<Self> {
        for window in segments.windows(2) {
            if window[0].kind >= window[1].kind {
                return Err(RtrmError::InvalidPath(format!(
                    "non-descending type order at {:?} -> {:?}",
                    window[0].kind, window[1].kind
                )));
            }
        }
        let mut seen = std::collections::HashSet::new();
        for seg in &segments {
            if !seen.insert(seg.kind) {
                return Err(RtrmError::InvalidPath(format!(
                    "duplicate type {:?} in path",
                    seg.kind
                )));
            }
        }
        Ok(Self { segments })
    }

    /// Parse a dotted string like `sys0.cpu1.pe3` or `sys0.cpu1.peANY`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut segments = Vec::new();
        for part in s.split('.') {
            let (tag, id_str) = split_tag_id(part)
                .ok_or_else(|| RtrmError::InvalidPath(format!("unparsable segment {part:?}")))?;
            let kind = ResourceType::from_tag(tag)
                .ok_or_else(|| RtrmError::InvalidPath(format!("unknown resource type {tag:?}")))?;
            let id = match id_str {
                "ANY" => ResourceId::Any,
                "NONE" => ResourceId::None,
                "" => ResourceId::None,
                n => ResourceId::Id(
                    n.parse()
                        .map_err(|_| RtrmError::InvalidPath(format!("bad id {n:?}")))?,
                ),
            };
            segments.push(PathSegment { kind, id });
        }
        Self::new(segments)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// `true` if every segment's id is `Any` or `None` — this path is a
    /// matching template, not a concrete resource.
    pub fn is_template(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s.id, ResourceId::Any | ResourceId::None))
    }

    /// Bind this (possibly templated) path against a concrete path of the
    /// same shape, substituting `Any`/`None` ids with the concrete ones.
    /// Returns `None` if the shapes (types, length) don't match.
    pub fn bind(&self, concrete: &ResourcePath) -> Option<ResourcePath> {
        if self.segments.len() != concrete.segments.len() {
            return None;
        }
        let mut out = Vec::with_capacity(self.segments.len());
        for (tmpl, conc) in self.segments.iter().zip(concrete.segments.iter()) {
            if tmpl.kind != conc.kind {
                return None;
            }
            let id = match tmpl.id {
                ResourceId::Any | ResourceId::None => conc.id,
                ResourceId::Id(_) => tmpl.id,
            };
            out.push(PathSegment { kind: tmpl.kind, id });
        }
        Some(ResourcePath { segments: out })
    }

    /// Rewrite the leading `System` segment's id to `NONE`-free local id 0.
    /// Used by the RPC server to translate a caller's `sysN....` prefix to
    /// the local system before looking the path up in the Accounter.
    pub fn rewrite_to_local_system(&self) -> ResourcePath {
        let mut segments = self.segments.clone();
        if let Some(first) = segments.first_mut() {
            if first.kind == ResourceType::System {
                first.id = ResourceId::Id(0);
            }
        }
        ResourcePath { segments }
    }

    pub fn to_dotted(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .segments
            .iter()
            .map(|s| format!("{}{}", s.kind.tag(), s.id))
            .collect();
        write!(f, "{}", parts.join("."))
    }
}

impl PartialOrd for ResourcePath {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourcePath {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.segments
            .iter()
            .map(|s| (s.kind, s.id))
            .cmp(other.segments.iter().map(|s| (s.kind, s.id)))
    }
}

fn split_tag_id(part: &str) -> Option<(&str, &str)> {
    let idx = part.find(|c: char| c.is_ascii_digit())
        .or_else(|| part.find("ANY"))
        .or_else(|| part.find("NONE"));
    match idx {
        Some(i) => Some((&part[..i], &part[i..])),
        None => Some((part, "")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_dotted_string() {
        let p = ResourcePath::parse("sys0.cpu1.pe3").unwrap();
        assert_eq!(p.to_dotted(), "sys0.cpu1.pe3");
        assert_eq!(p.depth(), 3);
    }

    #[test]
    fn template_detection() {
        let p = ResourcePath::parse("sys0.cpuANY.peANY").unwrap();
        assert!(p.is_template());
        let p2 = ResourcePath::parse("sys0.cpu1.pe3").unwrap();
        assert!(!p2.is_template());
    }

    #[test]
    fn binding_substitutes_templates() {
        let tmpl = ResourcePath::parse("sys0.cpuANY.peANY").unwrap();
        let concrete = ResourcePath::parse("sys0.cpu1.pe3").unwrap();
        let bound = tmpl.bind(&concrete).unwrap();
        assert_eq!(bound.to_dotted(), "sys0.cpu1.pe3");
    }

    #[test]
    fn rejects_non_descending_types() {
        let err = ResourcePath::new(vec![
            PathSegment { kind: ResourceType::Cpu, id: ResourceId::Id(0) },
            PathSegment { kind: ResourceType::System, id: ResourceId::Id(0) },
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_duplicate_types() {
        let err = ResourcePath::new(vec![
            PathSegment { kind: ResourceType::System, id: ResourceId::Id(0) },
            PathSegment { kind: ResourceType::System, id: ResourceId::Id(1) },
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn rewrite_to_local_system_forces_id_zero() {
        let p = ResourcePath::parse("sys3.mem0").unwrap();
        let local = p.rewrite_to_local_system();
        assert_eq!(local.to_dotted(), "sys0.mem0");
    }

    #[test]
    fn ordering_is_canonical() {
        let a = ResourcePath::parse("sys0.cpu0.pe0").unwrap();
        let b = ResourcePath::parse("sys0.cpu0.pe1").unwrap();
        assert!(a < b);
    }
}
