use tracing::Level;

/// Render an `EnvFilter` directive string: the default level followed by
/// one `module=level` directive per override.
pub fn filter_directives(level: Level, module_levels: &[(String, Level)]) -> String {
    let mut filter_str = level.to_string().to_lowercase();
    for (module, level) in module_levels {
        filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
    }
    filter_str
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_level_only() {
        assert_eq!(filter_directives(Level::WARN, &[]), "warn");
    }

    #[test]
    fn module_overrides_appended() {
        let overrides = vec![
            ("vigil_hooks".to_string(), Level::DEBUG),
            ("vigil_transaction".to_string(), Level::TRACE),
        ];
        assert_eq!(
            filter_directives(Level::INFO, &overrides),
            "info,vigil_hooks=debug,vigil_transaction=trace"
        );
    }
}
