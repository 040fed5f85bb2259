//! Bus name validation and match rules
//!
//! Validation follows the D-Bus naming rules: dotted identifiers for bus
//! and interface names, bare identifiers for members, "/"-separated
//! components for object paths. Match rules cover only the key set the
//! stack itself constructs and routes on (`type`, `sender`, `path`,
//! `interface`, `member`); the full rule grammar is out of scope.

use crate::error::{ProtoError, Result};
use crate::message::{Message, MessageKind};

const MAX_NAME_LEN: usize = 255;

fn is_member_char(c: char, first: bool) -> bool {
    c.is_ascii_alphabetic() || c == '_' || (!first && c.is_ascii_digit())
}

fn validate_dotted(kind: &'static str, name: &str, allow_dash: bool) -> Result<()> {
    let err = || ProtoError::InvalidName {
        kind,
        name: name.to_owned(),
    };
    if name.is_empty() || name.len() > MAX_NAME_LEN || !name.contains('.') {
        return Err(err());
    }
    for element in name.split('.') {
        if element.is_empty() {
            return Err(err());
        }
        let mut chars = element.chars();
        let first = chars.next().ok_or_else(err)?;
        if !(is_member_char(first, true) || (allow_dash && first == '-')) {
            return Err(err());
        }
        for c in chars {
            if !(is_member_char(c, false) || (allow_dash && c == '-')) {
                return Err(err());
            }
        }
    }
    Ok(())
}

/// Validate a bus name: a unique name (`:1.42`) or a well-known name.
pub fn validate_bus_name(name: &str) -> Result<()> {
    if let Some(rest) = name.strip_prefix(':') {
        // Unique names allow digit-led elements.
        let err = || ProtoError::InvalidName {
            kind: "bus",
            name: name.to_owned(),
        };
        if rest.is_empty() || name.len() > MAX_NAME_LEN || !rest.contains('.') {
            return Err(err());
        }
        for element in rest.split('.') {
            if element.is_empty()
                || !element
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(err());
            }
        }
        Ok(())
    } else {
        validate_dotted("bus", name, true)
    }
}

/// Validate an interface name.
pub fn validate_interface_name(name: &str) -> Result<()> {
    validate_dotted("interface", name, false)
}

/// Validate an error name. Same grammar as interface names.
pub fn validate_error_name(name: &str) -> Result<()> {
    validate_dotted("error", name, false)
}

/// Validate a member (method, property or signal) name.
pub fn validate_member_name(name: &str) -> Result<()> {
    let err = || ProtoError::InvalidName {
        kind: "member",
        name: name.to_owned(),
    };
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(err());
    }
    let mut chars = name.chars();
    let first = chars.next().ok_or_else(err)?;
    if !is_member_char(first, true) {
        return Err(err());
    }
    if !chars.all(|c| is_member_char(c, false)) {
        return Err(err());
    }
    Ok(())
}

/// Validate an object path.
pub fn validate_object_path(path: &str) -> Result<()> {
    let err = || ProtoError::InvalidPath(path.to_owned());
    if !path.starts_with('/') {
        return Err(err());
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(err());
    }
    for component in path[1..].split('/') {
        if component.is_empty()
            || !component
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(err());
        }
    }
    Ok(())
}

/// Split an object path into its components. The root path has none.
pub fn path_components(path: &str) -> Vec<&str> {
    if path == "/" {
        Vec::new()
    } else {
        path.trim_start_matches('/').split('/').collect()
    }
}

/// Depth of a path in components, counting the root as 1.
pub fn path_depth(path: &str) -> u32 {
    1 + path_components(path).len() as u32
}

/// Join a base path and a relative suffix.
pub fn join_paths(base: &str, relative: &str) -> String {
    let relative = relative.trim_matches('/');
    if base == "/" {
        format!("/{relative}")
    } else if relative.is_empty() {
        base.to_owned()
    } else {
        format!("{base}/{relative}")
    }
}

/// Whether two paths belong together: one is a prefix of the other on
/// component boundaries. A `None` target matches every path.
pub fn paths_belong(target: Option<&str>, path: &str) -> bool {
    let Some(target) = target else { return true };
    let t = path_components(target);
    let p = path_components(path);
    let shared = t.len().min(p.len());
    t[..shared] == p[..shared]
}

/// A minimal match rule over the keys this stack routes on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub msg_type: Option<MessageKind>,
    pub sender: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
}

impl MatchRule {
    /// A rule matching one signal by path, interface and member.
    pub fn signal(path: &str, interface: &str, member: &str) -> Self {
        MatchRule {
            msg_type: Some(MessageKind::Signal),
            sender: None,
            path: Some(path.to_owned()),
            interface: Some(interface.to_owned()),
            member: Some(member.to_owned()),
        }
    }

    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_owned());
        self
    }

    /// Render into the daemon's `key='value'` rule string.
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if let Some(t) = self.msg_type {
            let t = match t {
                MessageKind::MethodCall => "method_call",
                MessageKind::MethodReturn => "method_return",
                MessageKind::Error => "error",
                MessageKind::Signal => "signal",
            };
            parts.push(format!("type='{t}'"));
        }
        if let Some(s) = &self.sender {
            parts.push(format!("sender='{s}'"));
        }
        if let Some(p) = &self.path {
            parts.push(format!("path='{p}'"));
        }
        if let Some(i) = &self.interface {
            parts.push(format!("interface='{i}'"));
        }
        if let Some(m) = &self.member {
            parts.push(format!("member='{m}'"));
        }
        parts.join(",")
    }

    /// Parse a rule string previously produced by [`MatchRule::render`].
    /// Unknown keys are rejected; the full daemon grammar is out of scope.
    pub fn parse(rule: &str) -> Result<Self> {
        let err = || ProtoError::InvalidMatchRule(rule.to_owned());
        let mut out = MatchRule::default();
        if rule.trim().is_empty() {
            return Ok(out);
        }
        for part in rule.split(',') {
            let (key, raw) = part.split_once('=').ok_or_else(err)?;
            let value = raw
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .ok_or_else(err)?
                .to_owned();
            match key.trim() {
                "type" => {
                    out.msg_type = Some(match value.as_str() {
                        "method_call" => MessageKind::MethodCall,
                        "method_return" => MessageKind::MethodReturn,
                        "error" => MessageKind::Error,
                        "signal" => MessageKind::Signal,
                        _ => return Err(err()),
                    })
                }
                "sender" => out.sender = Some(value),
                "path" => out.path = Some(value),
                "interface" => out.interface = Some(value),
                "member" => out.member = Some(value),
                _ => return Err(err()),
            }
        }
        Ok(out)
    }

    /// Whether a message satisfies every present key.
    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(t) = self.msg_type {
            if msg.kind != t {
                return false;
            }
        }
        let field = |want: &Option<String>, have: &Option<String>| match want {
            Some(w) => have.as_deref() == Some(w.as_str()),
            None => true,
        };
        field(&self.sender, &msg.sender)
            && field(&self.path, &msg.path)
            && field(&self.interface, &msg.interface)
            && field(&self.member, &msg.member)
    }
}
