//! Path filtering
//!
//! `path=` parameters restrict current/sample documents to the subtree they
//! name. The matcher supports the common probe-path shapes:
//! `//Devices/Device[@uuid="000"]//Linear[@name="X"]//DataItem[@type="POSITION"]`
//! with `|`-separated alternatives. Each path segment must match the item's
//! element chain in order; `//` looseness falls out of subsequence matching.

use std::collections::HashSet;
use std::sync::Arc;

use mtc_model::{DataItem, Device};

#[derive(Debug, Clone, PartialEq)]
struct Segment {
    name: String,
    predicates: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct PathFilter {
    alternatives: Vec<Vec<Segment>>,
}

/// One element of a data item's chain, with its matchable attributes
struct ChainElement {
    name: String,
    attrs: Vec<(&'static str, String)>,
}

impl PathFilter {
    pub fn parse(path: &str) -> Option<Self> {
        let alternatives: Vec<Vec<Segment>> = path
            .split('|')
            .map(parse_alternative)
            .collect::<Option<_>>()?;
        if alternatives.iter().all(|a| a.is_empty()) {
            return None;
        }
        Some(Self { alternatives })
    }

    /// The ids of every data item the filter selects.
    pub fn select(&self, devices: &[Arc<Device>]) -> HashSet<String> {
        let mut selected = HashSet::new();
        for device in devices {
            for item in device.data_items() {
                if self.matches(device, &item) {
                    selected.insert(item.id().to_string());
                }
            }
        }
        selected
    }

    fn matches(&self, device: &Arc<Device>, item: &Arc<DataItem>) -> bool {
        let chain = element_chain(device, item);
        self.alternatives
            .iter()
            .any(|segments| subsequence_match(segments, &chain))
    }
}

fn parse_alternative(path: &str) -> Option<Vec<Segment>> {
    let mut segments = Vec::new();
    for raw in path.split('/') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let (name, predicate_part) = match raw.find('[') {
            Some(open) => {
                let close = raw.rfind(']')?;
                (&raw[..open], Some(&raw[open + 1..close]))
            }
            None => (raw, None),
        };

        let mut predicates = Vec::new();
        if let Some(predicate_part) = predicate_part {
            for clause in predicate_part.split(" and ") {
                let clause = clause.trim().strip_prefix('@')?;
                let (attr, value) = clause.split_once('=')?;
                let value = value.trim().trim_matches('"').trim_matches('\'');
                predicates.push((attr.trim().to_string(), value.to_string()));
            }
        }
        segments.push(Segment {
            name: name.to_string(),
            predicates,
        });
    }
    Some(segments)
}

fn element_chain(device: &Arc<Device>, item: &Arc<DataItem>) -> Vec<ChainElement> {
    let mut chain = vec![
        ChainElement {
            name: "Devices".to_string(),
            attrs: Vec::new(),
        },
        ChainElement {
            name: if device.is_agent() { "Agent" } else { "Device" }.to_string(),
            attrs: vec![
                ("uuid", device.uuid()),
                ("name", device.name()),
                ("id", device.id()),
            ],
        },
    ];

    // "Controller[Controller]/Path[path]" -> component elements
    for segment in item.path().split('/').filter(|s| !s.is_empty()) {
        let (component_type, name) = match segment.find('[') {
            Some(open) => (
                &segment[..open],
                Some(segment[open + 1..segment.len() - 1].to_string()),
            ),
            None => (segment, None),
        };
        let mut attrs = Vec::new();
        if let Some(name) = name {
            attrs.push(("name", name));
        }
        chain.push(ChainElement {
            name: component_type.to_string(),
            attrs,
        });
    }

    let mut attrs = vec![
        ("id", item.id().to_string()),
        ("type", item.type_name().to_string()),
        ("category", item.category().as_str().to_string()),
    ];
    if let Some(name) = item.name() {
        attrs.push(("name", name.to_string()));
    }
    if let Some(sub_type) = item.sub_type() {
        attrs.push(("subType", sub_type.to_string()));
    }
    chain.push(ChainElement {
        name: "DataItem".to_string(),
        attrs,
    });
    chain
}

fn segment_matches(segment: &Segment, element: &ChainElement) -> bool {
    if segment.name != "*" && segment.name != element.name {
        return false;
    }
    segment.predicates.iter().all(|(attr, value)| {
        element
            .attrs
            .iter()
            .any(|(name, actual)| name == attr && actual == value)
    })
}

fn subsequence_match(segments: &[Segment], chain: &[ChainElement]) -> bool {
    let mut position = 0;
    for segment in segments {
        let found = chain[position..]
            .iter()
            .position(|element| segment_matches(segment, element));
        match found {
            Some(offset) => position += offset + 1,
            None => return false,
        }
    }
    true
}
