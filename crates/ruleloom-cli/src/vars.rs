use ruleloom_engine::Node;

/// Parse a `key=value` argument
pub fn parse_key_value(arg: &str) -> Result<(String, String), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", arg))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{}'", arg));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Interpret a command line value the way a rule file would: numbers and
/// booleans keep their type, everything else is text.
pub fn property_value(raw: &str) -> Node {
    match Node::from_yaml_str(raw) {
        Ok(node @ Node::Scalar(_)) if !node.is_null() => node,
        _ => Node::from(raw),
    }
}
