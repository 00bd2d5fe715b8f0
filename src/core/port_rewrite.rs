//! Rewriting of `host:port` tokens inside JSON-like configuration text.
//!
//! The scanner only looks inside quoted string literals so that bare numbers and
//! structure elsewhere in the document are never touched. No JSON parser is involved,
//! so the input does not have to be well-formed.

use std::collections::HashMap;

/// Where replacement ports come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortTargets {
    /// Assigned to distinct old ports in the order they are first seen
    List(Vec<u16>),
    /// Explicit old port to new port mapping
    Map(HashMap<u16, u16>),
}

impl PortTargets {
    pub fn len(&self) -> usize {
        match self {
            PortTargets::List(ports) => ports.len(),
            PortTargets::Map(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<u16>> for PortTargets {
    fn from(ports: Vec<u16>) -> Self {
        PortTargets::List(ports)
    }
}

impl From<HashMap<u16, u16>> for PortTargets {
    fn from(map: HashMap<u16, u16>) -> Self {
        PortTargets::Map(map)
    }
}

/// Old port to new port assignments made during one rewrite, in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMap {
    entries: Vec<(u16, u16)>,
}

impl PortMap {
    pub fn get(&self, old: u16) -> Option<u16> {
        self.entries
            .iter()
            .find(|(from, _)| *from == old)
            .map(|(_, to)| *to)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, u16)> + '_ {
        self.entries.iter().copied()
    }

    fn insert(&mut self, old: u16, new: u16) {
        self.entries.push((old, new));
    }
}

impl From<&PortMap> for PortTargets {
    fn from(map: &PortMap) -> Self {
        PortTargets::Map(map.iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RewriteError {
    #[error(
        "Looking up port {port}: config has more ports specified than the {available} substitute ports available"
    )]
    TooManyPorts { port: u16, available: usize },
    #[error("Config has {found} distinct ports but {expected} substitute ports were supplied")]
    TooFewPorts { found: usize, expected: usize },
    #[error("Port {0} not in substitute port map")]
    UnmappedPort(u16),
}

/// Result of a successful rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRewrite {
    pub text: String,
    pub port_map: PortMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Normal,
    InsideString,
    StringEscape,
}

/// Walk `text`, handing every quoted literal (without its quotes) to `on_literal` and
/// copying its result back between the original quotes. An unterminated literal at the
/// end of input is dropped from the output, like any truncated token.
fn scan_literals<F>(text: &str, mut on_literal: F) -> Result<String, RewriteError>
where
    F: FnMut(&str) -> Result<String, RewriteError>,
{
    let mut out = String::with_capacity(text.len());
    let mut literal = String::new();
    let mut state = ScanState::Normal;

    for c in text.chars() {
        match state {
            ScanState::Normal => {
                out.push(c);
                if c == '"' {
                    literal.clear();
                    state = ScanState::InsideString;
                }
            }
            ScanState::InsideString => match c {
                '\\' => {
                    literal.push(c);
                    state = ScanState::StringEscape;
                }
                '"' => {
                    out.push_str(&on_literal(&literal)?);
                    out.push(c);
                    state = ScanState::Normal;
                }
                _ => literal.push(c),
            },
            ScanState::StringEscape => {
                literal.push(c);
                state = ScanState::InsideString;
            }
        }
    }

    Ok(out)
}

fn parse_port(component: &str) -> Option<u16> {
    if component.is_empty() || !component.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    component.parse().ok()
}

/// Positions examined for a port: the last component, then the one before it so a
/// trailing suffix after the port is tolerated.
fn port_positions(len: usize) -> impl Iterator<Item = usize> {
    [len.checked_sub(1), len.checked_sub(2)]
        .into_iter()
        .flatten()
}

fn rewrite_literal(
    literal: &str,
    targets: &PortTargets,
    port_map: &mut PortMap,
) -> Result<String, RewriteError> {
    let mut parts: Vec<String> = literal.split(':').map(str::to_string).collect();
    if parts.len() < 2 {
        return Ok(literal.to_string());
    }

    for idx in port_positions(parts.len()) {
        let Some(port) = parse_port(&parts[idx]) else {
            continue;
        };
        let new_port = match port_map.get(port) {
            Some(new_port) => new_port,
            None => {
                if port_map.len() >= targets.len() {
                    return Err(RewriteError::TooManyPorts {
                        port,
                        available: targets.len(),
                    });
                }
                let new_port = match targets {
                    PortTargets::List(ports) => ports[port_map.len()],
                    PortTargets::Map(map) => {
                        *map.get(&port).ok_or(RewriteError::UnmappedPort(port))?
                    }
                };
                port_map.insert(port, new_port);
                new_port
            }
        };
        parts[idx] = new_port.to_string();
    }

    Ok(parts.join(":"))
}

/// Replace every port found in quoted `host:port` literals of `text`.
///
/// Every target must be used exactly once: running out of targets fails as soon as
/// the extra port is seen, leftover targets fail once the scan completes.
pub fn rewrite(text: &str, targets: &PortTargets) -> Result<PortRewrite, RewriteError> {
    let mut port_map = PortMap::default();
    let text = scan_literals(text, |literal| {
        rewrite_literal(literal, targets, &mut port_map)
    })?;

    if port_map.len() < targets.len() {
        return Err(RewriteError::TooFewPorts {
            found: port_map.len(),
            expected: targets.len(),
        });
    }

    Ok(PortRewrite { text, port_map })
}

/// Convenience wrapper around [`rewrite`] returning only the text
pub fn replace_ports(text: &str, targets: &PortTargets) -> Result<String, RewriteError> {
    rewrite(text, targets).map(|r| r.text)
}

/// Distinct ports found in quoted literals, in first-seen order
pub fn scan_ports(text: &str) -> Vec<u16> {
    let mut found = Vec::new();
    // the callback never fails
    let _ = scan_literals(text, |literal| {
        let parts: Vec<&str> = literal.split(':').collect();
        if parts.len() >= 2 {
            for idx in port_positions(parts.len()) {
                if let Some(port) = parse_port(parts[idx]) {
                    if !found.contains(&port) {
                        found.push(port);
                    }
                }
            }
        }
        Ok(literal.to_string())
    });
    found
}

/// Plain sequential find-and-replace. Later pairs see the output of earlier ones.
pub fn replace_strings<K, V>(text: &str, replacements: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    replacements
        .iter()
        .fold(text.to_string(), |acc, (from, to)| {
            acc.replace(from.as_ref(), to.as_ref())
        })
}
