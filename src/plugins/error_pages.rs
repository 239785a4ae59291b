use async_trait::async_trait;
use dashmap::DashSet;

use super::{CapDecision, Capabilities, FindingCap, Plugin, PluginContext, PluginError};
use crate::matcher::Matcher;
use crate::model::{FetchResult, Finding, Severity};

const NAME: &str = "error_pages";

/// Literal fragments of framework and server error pages.
const ERROR_PAGES: &[&str] = &[
    "<H1>Error page exception</H1>",
    "<h2> <i>Runtime Error</i> </h2></span>",
    "<h2> <i>Access is denied</i> </h2></span>",
    "<H3>Original Exception: </H3>",
    "Server object error",
    "invalid literal for int()",
    "exceptions.ValueError",
    "<font face=\"Arial\" size=2>Type mismatch: ",
    "[an error occurred while processing this directive]",
    "<HTML><HEAD><TITLE>Error Occurred While Processing Request</TITLE></HEAD><BODY><HR><H3>Error Occurred While Processing Request</H3><P>",
    "<p>Microsoft VBScript runtime </font>",
    "<font face=\"Arial\" size=2>error '800a000d'</font>",
    "<TITLE>nwwcgi Error",
    "<font face=\"Arial\" size=2>error '800a0005'</font>",
    "Operation is not allowed when the object is closed.",
    "<p>Active Server Pages</font> <font face=\"Arial\" size=2>error 'ASP 0126'</font>",
    "<b> Description: </b>An unhandled exception occurred during the execution of the current web request",
    "] does not contain handler parameter named",
    "<b>Warning</b>: ",
    "No row with the given identifier",
    "open_basedir restriction in effect",
    "eval()'d code</b> on line <b>",
    "Cannot execute a blank command in",
    "Fatal error</b>:  preg_replace",
    "thrown in <b>",
    "#0 {main}",
    "Stack trace:",
    "</b> on line <b>",
    "PythonHandler django.core.handlers.modpython",
    "t = loader.get_template(template_name) # You need to create a 404.html template.",
    "<h2>Traceback <span>(innermost last)</span></h2>",
    "[java.lang.",
    "class java.lang.",
    "java.lang.NullPointerException",
    "java.rmi.ServerException",
    "at java.lang.",
    "onclick=\"toggle('full exception chain stacktrace')\"",
    "at org.apache.catalina",
    "at org.apache.coyote.",
    "at org.apache.tomcat.",
    "at org.apache.jasper.",
    "<html><head><title>Application Exception</title>",
    "<h1 class=\"error_title\">Ruby on Rails application could not be started</h1>",
    "<title>Error Occurred While Processing Request</title></head><body><p></p>",
    "<HTML><HEAD><TITLE>Error Occurred While Processing Request</TITLE></HEAD><BODY><HR><H3>",
    "<TR><TD><H4>Error Diagnostic Information</H4><P><P>",
    "Server.Execute Error",
    "<h2 style=\"font:8pt/11pt verdana; color:000000\">HTTP 403.6 - Forbidden: IP address rejected<br>",
    "<TITLE>500 Internal Server Error</TITLE>",
];

/// Version banners on error pages, with the product they identify.
const VERSION_PATTERNS: &[(&str, &str)] = &[
    (r"<address>(.*?)</address>", "Apache"),
    (r#"<HR size="1" noshade="noshade"><h3>(.*?)</h3></body>"#, "Apache Tomcat"),
    (
        r#"<a href="http://www\.microsoft\.com/ContentRedirect\.asp\?prd=iis&sbp=&pver=(.*?)&pid=&ID"#,
        "IIS",
    ),
    (r"<b>Version Information:</b>&nbsp;(.*?)\n", "ASP .NET"),
];

/// Greps responses for descriptive error pages and version banners.
pub struct ErrorPages {
    errors: Matcher,
    versions: Matcher,
    reported_urls: DashSet<String>,
    reported_versions: DashSet<String>,
    cap: FindingCap,
}

impl ErrorPages {
    pub fn new() -> Result<Self, PluginError> {
        Ok(Self {
            errors: Matcher::build(ERROR_PAGES.iter().map(|s| regex::escape(s)))?,
            versions: Matcher::build(VERSION_PATTERNS.iter().map(|(p, _)| *p))?,
            reported_urls: DashSet::new(),
            reported_versions: DashSet::new(),
            cap: FindingCap::default(),
        })
    }

    fn find_error_page(&self, ctx: &PluginContext, exchange: &FetchResult) -> Vec<Finding> {
        let url = &exchange.request.url;
        if self.reported_urls.contains(url) {
            return Vec::new();
        }
        // one report per response, first signature wins
        let Some(hit) = self.errors.query(&exchange.response.body).into_iter().next() else {
            return Vec::new();
        };
        let signature = ERROR_PAGES[hit.pattern];
        match self.cap.check(signature, ctx.max_findings_per_plugin) {
            CapDecision::Report => {
                self.reported_urls.insert(url.clone());
                let desc = format!("The URL: \"{url}\" contains the descriptive error: \"{signature}\".");
                vec![Finding::new(NAME, "Descriptive error page", Severity::Information, &exchange.request, desc)
                    .with_evidence(signature, exchange.id)]
            }
            CapDecision::LimitReached => {
                let desc = "The application returned multiple HTTP responses containing detailed error \
                            pages. The maximum number of reports for this error was reached and no more \
                            will be reported.";
                vec![Finding::new(
                    NAME,
                    "Multiple descriptive error pages",
                    Severity::Information,
                    &exchange.request,
                    desc,
                )
                .with_evidence(signature, exchange.id)]
            }
            CapDecision::Suppress => Vec::new(),
        }
    }

    fn find_version_numbers(&self, exchange: &FetchResult) -> Vec<Finding> {
        let status = exchange.response.status;
        if !(401..600).contains(&status) {
            return Vec::new();
        }
        let body = &exchange.response.body;
        let mut findings = Vec::new();
        for hit in self.versions.query(body) {
            let banner = &body[hit.start..hit.end];
            if !self.reported_versions.insert(banner.to_string()) {
                continue;
            }
            let server = VERSION_PATTERNS[hit.pattern].1;
            let desc = format!("An error page sent this {server} version: \"{}\".", banner.trim());
            findings.push(
                Finding::new(
                    NAME,
                    "Error page with information disclosure",
                    Severity::Information,
                    &exchange.request,
                    desc,
                )
                .with_evidence(banner.trim(), exchange.id),
            );
        }
        findings
    }
}

#[async_trait]
impl Plugin for ErrorPages {
    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::GREP
    }

    async fn grep(
        &self,
        ctx: &PluginContext,
        exchange: &FetchResult,
    ) -> Result<Vec<Finding>, PluginError> {
        let ct = exchange.response.content_type().to_ascii_lowercase();
        if !(ct.is_empty() || ct.starts_with("text/") || exchange.response.is_html()) {
            return Ok(Vec::new());
        }
        let mut findings = self.find_error_page(ctx, exchange);
        findings.extend(self.find_version_numbers(exchange));
        Ok(findings)
    }
}
