use crate::cli::args::CliArgs;
use crate::output::OutputFormat;

pub fn validate(args: &CliArgs) -> Result<(), String> {
    for (flag, raw) in [
        ("--crawl-workers", args.crawl_workers.as_deref()),
        ("--audit-workers", args.audit_workers.as_deref()),
        ("--grep-workers", args.grep_workers.as_deref()),
    ] {
        if let Some(raw) = raw {
            let (min, _) = crate::utils::parse_range_usize(raw)
                .map_err(|e| format!("invalid {flag} '{raw}': {e}"))?;
            if min == 0 {
                return Err(format!("invalid {flag} '{raw}': MIN must be at least 1"));
            }
        }
    }
    if let Some(raw) = args.grep_watermarks.as_deref() {
        let (low, high) = crate::utils::parse_range_usize(raw)
            .map_err(|e| format!("invalid --grep-watermarks '{raw}': {e}"))?;
        if low == high {
            return Err(format!(
                "invalid --grep-watermarks '{raw}': LOW must be below HIGH"
            ));
        }
    }
    if let Some(raw) = args.header.as_deref() {
        crate::utils::parse_header_lines(raw).map_err(|e| format!("invalid --header: {e}"))?;
    }
    if let Some(raw) = args.output_format.as_deref() {
        if OutputFormat::parse(raw).is_none() {
            return Err(format!(
                "invalid --output-format '{raw}', expected text, json, or xml"
            ));
        }
    }
    if let Some(raw) = args.plugins.as_deref() {
        for name in crate::utils::parse_csv_list(raw) {
            if !crate::plugins::BUILTIN_PLUGINS.contains(&name.as_str()) {
                return Err(format!(
                    "unknown plugin '{name}', expected one of: {}",
                    crate::plugins::BUILTIN_PLUGINS.join(", ")
                ));
            }
        }
    }
    if args.max_depth == Some(0) {
        return Err("invalid max-depth, expected positive integer".to_string());
    }
    if args.timeout == Some(0) {
        return Err("invalid timeout, expected positive integer".to_string());
    }
    if args.parser_workers == Some(0) {
        return Err("invalid parser-workers, expected positive integer".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn parse(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["scanline", "-u", "http://example.com/"];
        argv.extend_from_slice(extra);
        CliArgs::parse_from(argv)
    }

    #[test]
    fn accepts_defaults() {
        assert!(validate(&parse(&[])).is_ok());
    }

    #[test]
    fn rejects_bad_ranges() {
        assert!(validate(&parse(&["--crawl-workers", "0-4"])).is_err());
        assert!(validate(&parse(&["--grep-workers", "8-2"])).is_err());
        assert!(validate(&parse(&["--grep-watermarks", "10-10"])).is_err());
        assert!(validate(&parse(&["--grep-watermarks", "100-400"])).is_ok());
    }

    #[test]
    fn rejects_unknown_plugins_and_formats() {
        let err = validate(&parse(&["--plugins", "web_spider,sqli"])).unwrap_err();
        assert!(err.contains("sqli"));
        assert!(validate(&parse(&["--output-format", "html"])).is_err());
        assert!(validate(&parse(&["--header", "no colon here"])).is_err());
    }
}
