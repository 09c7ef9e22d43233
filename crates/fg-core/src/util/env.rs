use std::time::Duration;

/// Boolean environment variable: present and not one of
/// "0" / "false" / "off" / "no" (case-insensitive) means true.
pub fn env_bool(key: &str) -> bool {
    match std::env::var(key) {
        Ok(v) => {
            let s = v.trim().to_ascii_lowercase();
            !(s.is_empty() || s == "0" || s == "false" || s == "off" || s == "no")
        }
        Err(_) => false,
    }
}

/// Unsigned integer environment variable with a default.
pub fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

/// Millisecond duration environment variable with a default.
pub fn env_duration_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_u64(key, default_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_parsing() {
        std::env::set_var("FG_ENV_T1", "1");
        assert!(env_bool("FG_ENV_T1"));
        std::env::set_var("FG_ENV_T2", "TRUE");
        assert!(env_bool("FG_ENV_T2"));
        std::env::set_var("FG_ENV_T3", "off");
        assert!(!env_bool("FG_ENV_T3"));
        std::env::remove_var("FG_ENV_T4");
        assert!(!env_bool("FG_ENV_T4"));
    }

    #[test]
    fn numeric_parsing() {
        std::env::set_var("FG_ENV_N1", "1500");
        assert_eq!(env_u64("FG_ENV_N1", 7), 1500);
        assert_eq!(env_duration_ms("FG_ENV_N1", 5).as_millis(), 1500);
        std::env::set_var("FG_ENV_N2", "junk");
        assert_eq!(env_u64("FG_ENV_N2", 9), 9);
    }
}
