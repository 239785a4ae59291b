use clap::{ArgAction, Parser};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "scanline",
    version,
    about = "scan coordination and backpressure engine for web application scanners",
    long_about = "Scanline crawls a target, audits what it finds and greps every response, while keeping each stage bounded under load.\n\nExamples:\n  scanline -u https://target.tld/\n  scanline -u https://target.tld/ -r 50 --plugins web_spider,error_pages -o report.json\n  scanline -u https://target.tld/ --config ~/.scanline/config.yml\n\nTip: Use --config to persist scan settings and keep CLI invocations short."
)]
pub struct CliArgs {
    #[arg(
        short = 'v',
        long = "vb",
        visible_alias = "verbose",
        action = ArgAction::Count,
        help_heading = "Output",
        help = "Increase log verbosity (-v info, -vv debug, -vvv trace)."
    )]
    pub verbose: u8,

    #[arg(
        short = 'n',
        long = "nc",
        visible_alias = "no-color",
        help_heading = "Output",
        help = "Disable colored output."
    )]
    pub no_color: bool,

    #[arg(
        short = 'q',
        long = "qt",
        visible_alias = "quiet",
        help_heading = "Output",
        help = "Hide the banner and progress spinner."
    )]
    pub quiet: bool,

    #[arg(
        short = 'E',
        long = "se",
        visible_alias = "show-errors",
        help_heading = "Output",
        help = "Print plugin errors as they happen."
    )]
    pub show_errors: bool,

    #[arg(
        short = 'o',
        long = "out",
        visible_alias = "output",
        value_name = "FILE",
        help_heading = "Output",
        help = "Write the final report to a file."
    )]
    pub output: Option<String>,

    #[arg(
        short = 'A',
        long = "of",
        visible_alias = "output-format",
        value_name = "FORMAT",
        help_heading = "Output",
        help = "Report format (text, json, xml). Inferred from --output when omitted."
    )]
    pub output_format: Option<String>,

    #[arg(
        long = "ev",
        visible_alias = "events",
        value_name = "FILE",
        help_heading = "Output",
        help = "Stream every output event to a JSON-lines file."
    )]
    pub events: Option<String>,

    #[arg(
        long = "mfp",
        visible_alias = "max-findings-per-plugin",
        value_name = "N",
        help_heading = "Output",
        help = "Stop reporting a finding kind after N hits per plugin."
    )]
    pub max_findings_per_plugin: Option<usize>,

    #[arg(
        short = 'u',
        long = "u",
        visible_alias = "url",
        value_name = "URL",
        action = ArgAction::Append,
        help_heading = "Input",
        help = "Target URL (repeatable)."
    )]
    pub url: Vec<String>,

    #[arg(
        short = 'i',
        long = "if",
        visible_alias = "input-file",
        value_name = "FILE",
        help_heading = "Input",
        help = "Load target URLs from a file (one per line)."
    )]
    pub input_file: Option<String>,

    #[arg(
        short = 'C',
        long = "cfg",
        visible_alias = "config",
        value_name = "FILE",
        help_heading = "Input",
        help = "Path to config file (defaults to ~/.scanline/config.yml)."
    )]
    pub config: Option<String>,

    #[arg(
        long = "ic",
        visible_alias = "init-config",
        help_heading = "Input",
        help = "Write a default config file if none exists, then exit."
    )]
    pub init_config: bool,

    #[arg(
        short = 'P',
        long = "pg",
        visible_alias = "plugins",
        value_name = "LIST",
        help_heading = "Scan",
        help = "Comma-separated plugins to enable (default: all built-in plugins)."
    )]
    pub plugins: Option<String>,

    #[arg(
        long = "lp",
        visible_alias = "list-plugins",
        help_heading = "Scan",
        help = "List built-in plugins and exit."
    )]
    pub list_plugins: bool,

    #[arg(
        short = 's',
        long = "sc",
        visible_alias = "scope",
        value_name = "HOSTS",
        help_heading = "Scan",
        help = "Comma-separated hosts the crawl may visit (default: the target hosts)."
    )]
    pub scope: Option<String>,

    #[arg(
        long = "md",
        visible_alias = "max-depth",
        value_name = "N",
        help_heading = "Scan",
        help = "Maximum crawl depth from the seed URLs."
    )]
    pub max_depth: Option<u32>,

    #[arg(
        long = "pt",
        visible_alias = "plugin-timeout",
        value_name = "SECONDS",
        help_heading = "Scan",
        help = "Deadline for a single plugin call."
    )]
    pub plugin_timeout: Option<u64>,

    #[arg(
        short = 'r',
        long = "rt",
        visible_alias = "rate",
        value_name = "RPS",
        help_heading = "Performance",
        help = "Request rate limit (requests per second, 0 = unlimited)."
    )]
    pub rate: Option<u32>,

    #[arg(
        short = 'w',
        long = "wrk",
        visible_alias = "workers",
        value_name = "N",
        help_heading = "Performance",
        help = "Number of runtime worker threads."
    )]
    pub workers: Option<usize>,

    #[arg(
        short = 't',
        long = "ps",
        visible_alias = "pool-size",
        value_name = "N",
        help_heading = "Performance",
        help = "Max pooled connections per host."
    )]
    pub pool_size: Option<usize>,

    #[arg(
        long = "cw",
        visible_alias = "crawl-workers",
        value_name = "MIN-MAX",
        help_heading = "Performance",
        help = "Crawl stage worker bounds."
    )]
    pub crawl_workers: Option<String>,

    #[arg(
        long = "aw",
        visible_alias = "audit-workers",
        value_name = "MIN-MAX",
        help_heading = "Performance",
        help = "Audit stage worker bounds."
    )]
    pub audit_workers: Option<String>,

    #[arg(
        long = "gw",
        visible_alias = "grep-workers",
        value_name = "MIN-MAX",
        help_heading = "Performance",
        help = "Grep stage worker bounds."
    )]
    pub grep_workers: Option<String>,

    #[arg(
        long = "gwm",
        visible_alias = "grep-watermarks",
        value_name = "LOW-HIGH",
        help_heading = "Performance",
        help = "Grep queue depths that stop and resume grep admission."
    )]
    pub grep_watermarks: Option<String>,

    #[arg(
        long = "spd",
        visible_alias = "spill-dir",
        value_name = "DIR",
        help_heading = "Performance",
        help = "Directory for queue items that overflow memory."
    )]
    pub spill_dir: Option<String>,

    #[arg(
        long = "pw",
        visible_alias = "parser-workers",
        value_name = "N",
        help_heading = "Parser",
        help = "Number of parser processes."
    )]
    pub parser_workers: Option<usize>,

    #[arg(
        long = "pml",
        visible_alias = "parser-memory-limit",
        value_name = "MB",
        help_heading = "Parser",
        help = "Memory limit per parser process."
    )]
    pub parser_memory_limit: Option<u64>,

    #[arg(
        long = "pto",
        visible_alias = "parser-timeout",
        value_name = "SECONDS",
        help_heading = "Parser",
        help = "Deadline for parsing a single document."
    )]
    pub parser_timeout: Option<u64>,

    #[arg(
        long = "ip",
        visible_alias = "inline-parser",
        help_heading = "Parser",
        help = "Parse documents inside the scanner process (trusted targets only)."
    )]
    pub inline_parser: bool,

    #[arg(
        short = 'p',
        long = "px",
        visible_alias = "proxy",
        value_name = "URL",
        help_heading = "HTTP",
        help = "HTTP proxy URL (e.g. http://127.0.0.1:8080)."
    )]
    pub proxy: Option<String>,

    #[arg(
        short = 'F',
        long = "frd",
        visible_alias = "follow-redirects",
        help_heading = "HTTP",
        help = "Follow HTTP redirects."
    )]
    pub follow_redirects: bool,

    #[arg(
        short = 'T',
        long = "to",
        visible_alias = "timeout",
        value_name = "SECONDS",
        help_heading = "HTTP",
        help = "Initial per-request timeout; adapts to the target during the scan."
    )]
    pub timeout: Option<u64>,

    #[arg(
        short = 'H',
        long = "hdr",
        visible_alias = "header",
        value_name = "HEADER",
        help_heading = "HTTP",
        help = "Add headers to all requests (format: 'Key: Value', separated by ';')."
    )]
    pub header: Option<String>,
}
