//! Topic name and topic filter validation
//!
//! Publish topics are concrete names; subscribe filters may carry `+` and `#`
//! wildcards in the positions MQTT 3.1.1 allows.

/// UTF-8 strings in MQTT are length-prefixed by a u16
pub const MAX_TOPIC_LEN: usize = u16::MAX as usize;

/// Check a topic name used for PUBLISH
pub fn validate_publish_topic(topic: &str) -> Result<(), String> {
    check_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err("wildcards are not allowed in publish topics".to_string());
    }
    Ok(())
}

/// Check a topic filter used for SUBSCRIBE
pub fn validate_subscribe_filter(filter: &str) -> Result<(), String> {
    check_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != levels.len() - 1) {
            return Err("'#' must occupy the whole last level".to_string());
        }
        if level.contains('+') && *level != "+" {
            return Err("'+' must occupy a whole level".to_string());
        }
    }
    Ok(())
}

fn check_common(value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err("must not be empty".to_string());
    }
    if value.len() > MAX_TOPIC_LEN {
        return Err(format!("{} bytes exceeds {MAX_TOPIC_LEN}", value.len()));
    }
    if value.contains('\0') {
        return Err("must not contain NUL".to_string());
    }
    Ok(())
}
