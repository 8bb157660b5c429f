// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

//! Configuration tree.
//!
//! Guests, their VCPUs, regions and emulator bindings are described by a
//! tree of named nodes carrying typed attributes. The tree is loaded either
//! from JSON or from a flattened device tree blob.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceTreeError {
    #[error("Cannot parse JSON configuration: {0}")]
    Json(#[source] serde_json::Error),
    #[error("Cannot parse device tree blob: {0}")]
    Fdt(String),
    #[error("No node at {0}")]
    MissingNode(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged, from = "RawAttr")]
pub enum AttrValue {
    String(String),
    Strings(Vec<String>),
    U32s(Vec<u32>),
    U64s(Vec<u64>),
    Bytes(Vec<u8>),
}

// JSON has no notion of cells: accept scalars and lists alike.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawAttr {
    Number(u64),
    String(String),
    Strings(Vec<String>),
    U32s(Vec<u32>),
    U64s(Vec<u64>),
    Bool(bool),
}

impl From<RawAttr> for AttrValue {
    fn from(raw: RawAttr) -> Self {
        match raw {
            RawAttr::Number(n) => match u32::try_from(n) {
                Ok(n) => AttrValue::U32s(vec![n]),
                Err(_) => AttrValue::U64s(vec![n]),
            },
            RawAttr::String(s) => AttrValue::String(s),
            RawAttr::Strings(v) => AttrValue::Strings(v),
            RawAttr::U32s(v) => AttrValue::U32s(v),
            RawAttr::U64s(v) => AttrValue::U64s(v),
            RawAttr::Bool(b) => AttrValue::U32s(vec![u32::from(b)]),
        }
    }
}

fn parse_int(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16).ok(),
        None => s.replace('_', "").parse().ok(),
    }
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            AttrValue::Strings(v) => v.first().map(String::as_str),
            _ => None,
        }
    }

    /// One or two cells make a 64-bit value, most significant cell first.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            AttrValue::U32s(v) => match v.as_slice() {
                [lo] => Some(u64::from(*lo)),
                [hi, lo] => Some(u64::from(*hi) << 32 | u64::from(*lo)),
                _ => None,
            },
            AttrValue::U64s(v) => v.first().copied(),
            AttrValue::String(s) => parse_int(s),
            _ => None,
        }
    }

    pub fn as_u32_list(&self) -> Option<Vec<u32>> {
        match self {
            AttrValue::U32s(v) => Some(v.clone()),
            AttrValue::U64s(v) => v.iter().map(|n| u32::try_from(*n).ok()).collect(),
            AttrValue::String(s) => parse_int(s).and_then(|n| u32::try_from(n).ok()).map(|n| vec![n]),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceNode {
    pub name: String,
    #[serde(default)]
    pub compatible: Vec<String>,
    #[serde(default)]
    pub attrs: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub children: Vec<DeviceNode>,
}

impl DeviceNode {
    pub fn new(name: &str) -> Self {
        DeviceNode {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, DeviceTreeError> {
        serde_json::from_str(json).map_err(DeviceTreeError::Json)
    }

    pub fn to_json(&self) -> Result<String, DeviceTreeError> {
        serde_json::to_string_pretty(self).map_err(DeviceTreeError::Json)
    }

    /// Builds the tree rooted at `/` of a flattened device tree blob.
    pub fn from_fdt(blob: &[u8]) -> Result<Self, DeviceTreeError> {
        let fdt =
            fdt_parser::Fdt::new(blob).map_err(|e| DeviceTreeError::Fdt(format!("{:?}", e)))?;
        let root = fdt
            .find_node("/")
            .ok_or_else(|| DeviceTreeError::MissingNode("/".to_string()))?;
        Ok(Self::convert_fdt_node(root))
    }

    fn convert_fdt_node(node: fdt_parser::node::FdtNode<'_, '_>) -> Self {
        let mut out = DeviceNode::new(node.name);
        for property in node.properties() {
            let value = fdt_property_value(property.value);
            if property.name == "compatible" {
                out.compatible = match value {
                    AttrValue::String(s) => vec![s],
                    AttrValue::Strings(v) => v,
                    _ => Vec::new(),
                };
                continue;
            }
            out.attrs.insert(property.name.to_string(), value);
        }
        out.children = node.children().map(Self::convert_fdt_node).collect();
        out
    }

    pub fn with_compatible(mut self, compatible: &str) -> Self {
        self.compatible.push(compatible.to_string());
        self
    }

    pub fn with_attr(mut self, name: &str, value: AttrValue) -> Self {
        self.attrs.insert(name.to_string(), value);
        self
    }

    pub fn with_str(self, name: &str, value: &str) -> Self {
        self.with_attr(name, AttrValue::String(value.to_string()))
    }

    pub fn with_u64(self, name: &str, value: u64) -> Self {
        self.with_attr(name, AttrValue::U64s(vec![value]))
    }

    pub fn with_u32s(self, name: &str, value: &[u32]) -> Self {
        self.with_attr(name, AttrValue::U32s(value.to_vec()))
    }

    pub fn with_child(mut self, child: DeviceNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attr(name)?.as_str()
    }

    pub fn attr_u64(&self, name: &str) -> Option<u64> {
        self.attr(name)?.as_u64()
    }

    pub fn attr_u32(&self, name: &str) -> Option<u32> {
        self.attr_u64(name).and_then(|n| u32::try_from(n).ok())
    }

    pub fn attr_u32_list(&self, name: &str) -> Option<Vec<u32>> {
        self.attr(name)?.as_u32_list()
    }

    /// Flag words: present and non-zero.
    pub fn flag(&self, name: &str) -> bool {
        match self.attr(name) {
            Some(AttrValue::Bytes(b)) => b.is_empty() || b.iter().any(|b| *b != 0),
            Some(v) => v.as_u64().map(|n| n != 0).unwrap_or(true),
            None => false,
        }
    }

    pub fn is_compatible(&self, compatible: &str) -> bool {
        self.compatible.iter().any(|c| c == compatible)
    }

    pub fn child(&self, name: &str) -> Option<&DeviceNode> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Looks up a `/`-separated path relative to this node.
    pub fn find(&self, path: &str) -> Option<&DeviceNode> {
        path.split('/')
            .filter(|p| !p.is_empty())
            .try_fold(self, |node, part| node.child(part))
    }

    pub fn phandle(&self) -> Option<u32> {
        self.attr_u32("phandle")
    }

    /// Depth first search for the node carrying `phandle`.
    pub fn find_phandle(&self, phandle: u32) -> Option<&DeviceNode> {
        if self.phandle() == Some(phandle) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_phandle(phandle))
    }
}

// Property payloads are untyped: strings are NUL terminated printable
// runs, everything else is a list of big endian cells.
fn fdt_property_value(value: &[u8]) -> AttrValue {
    if value.is_empty() {
        return AttrValue::Bytes(Vec::new());
    }

    let printable = value.last() == Some(&0)
        && value[0] != 0
        && value
            .iter()
            .all(|b| *b == 0 || b.is_ascii_graphic() || *b == b' ')
        && !value.windows(2).any(|w| w == [0, 0]);
    if printable {
        let strings: Vec<String> = value[..value.len() - 1]
            .split(|b| *b == 0)
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();
        return match strings.len() {
            1 => AttrValue::String(strings[0].clone()),
            _ => AttrValue::Strings(strings),
        };
    }

    if value.len() % 4 == 0 {
        return AttrValue::U32s(
            value
                .chunks_exact(4)
                .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        );
    }

    AttrValue::Bytes(value.to_vec())
}
