use std::io::{self, BufRead, Write};

use regex::Regex;
use url::Url;

use super::protocol::{Form, ParseJob, ParseReply, ParsedDocument};

/// Compiled once per worker process.
pub struct DocumentPatterns {
    title: Regex,
    link: Regex,
    form: Regex,
    form_end: Regex,
    attr_action: Regex,
    attr_method: Regex,
    input_name: Regex,
}

impl DocumentPatterns {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            title: Regex::new(r"(?is)<title[^>]*>(.*?)</title>")?,
            link: Regex::new(r#"(?i)\b(?:href|src|action)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>"']+))"#)?,
            form: Regex::new(r"(?i)<form\b([^>]*)>")?,
            form_end: Regex::new(r"(?i)</form\s*>")?,
            attr_action: Regex::new(r#"(?i)\baction\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>"']+))"#)?,
            attr_method: Regex::new(r#"(?i)\bmethod\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>"']+))"#)?,
            input_name: Regex::new(
                r#"(?i)<(?:input|select|textarea)\b[^>]*\bname\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>"']+))"#,
            )?,
        })
    }
}

fn first_group(caps: &regex::Captures<'_>) -> Option<String> {
    (1..caps.len())
        .find_map(|i| caps.get(i))
        .map(|m| m.as_str().trim().to_string())
}

fn resolve(base: Option<&Url>, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with('#') {
        return None;
    }
    let url = match base {
        Some(base) => base.join(raw).ok()?,
        None => Url::parse(raw).ok()?,
    };
    match url.scheme() {
        "http" | "https" => {
            let mut url = url;
            url.set_fragment(None);
            Some(url.to_string())
        }
        _ => None,
    }
}

/// Extracts title, links and forms from an HTML-ish document.
pub fn parse_document(patterns: &DocumentPatterns, base_url: &str, document: &str) -> ParsedDocument {
    let base = Url::parse(base_url).ok();
    let mut parsed = ParsedDocument {
        title: patterns
            .title
            .captures(document)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|t| !t.is_empty()),
        ..ParsedDocument::default()
    };

    for caps in patterns.link.captures_iter(document) {
        if let Some(link) = first_group(&caps).and_then(|raw| resolve(base.as_ref(), &raw)) {
            if !parsed.links.contains(&link) {
                parsed.links.push(link);
            }
        }
    }

    for caps in patterns.form.captures_iter(document) {
        let (Some(whole), Some(attrs)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let attrs = attrs.as_str();
        let action = patterns
            .attr_action
            .captures(attrs)
            .and_then(|c| first_group(&c))
            .unwrap_or_default();
        let Some(action) = resolve(base.as_ref(), &action).or_else(|| base.as_ref().map(|b| b.to_string())) else {
            continue;
        };
        let method = patterns
            .attr_method
            .captures(attrs)
            .and_then(|c| first_group(&c))
            .map(|m| m.to_ascii_uppercase())
            .filter(|m| m == "GET" || m == "POST")
            .unwrap_or_else(|| "GET".to_string());

        let body_start = whole.end();
        let body_end = patterns
            .form_end
            .find(&document[body_start..])
            .map(|m| body_start + m.start())
            .unwrap_or(document.len());
        let mut inputs = Vec::new();
        for input in patterns.input_name.captures_iter(&document[body_start..body_end]) {
            if let Some(name) = first_group(&input).filter(|n| !n.is_empty()) {
                if !inputs.contains(&name) {
                    inputs.push(name);
                }
            }
        }
        parsed.forms.push(Form {
            action,
            method,
            inputs,
        });
    }
    parsed
}

/// Child-side loop: one JSON job per stdin line, one JSON reply per stdout
/// line, until stdin closes.
pub fn run_worker_loop<R: BufRead, W: Write>(input: R, mut output: W) -> io::Result<()> {
    let patterns =
        DocumentPatterns::new().map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let reply = match serde_json::from_str::<ParseJob>(&line) {
            Ok(job) => ParseReply {
                id: job.id,
                document: Some(parse_document(&patterns, &job.base_url, &job.document)),
                error: None,
            },
            Err(e) => ParseReply {
                id: 0,
                document: None,
                error: Some(format!("malformed job: {e}")),
            },
        };
        let encoded = serde_json::to_string(&reply)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        output.write_all(encoded.as_bytes())?;
        output.write_all(b"\n")?;
        output.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>
        Admin   Login </title></head>
        <body>
          <a href="/about">About</a> <a href='contact.php?x=1#top'>C</a>
          <a href="mailto:a@b.c">mail</a> <a href="/about">dup</a>
          <img src=/img/logo.png>
          <form action="/login" method="post">
            <input type="text" name="user"><input name='pass' type=password>
            <select name="lang"></select>
          </form>
          <form><input name="q"></form>
        </body></html>"#;

    #[test]
    fn extracts_title_links_and_forms() {
        let p = DocumentPatterns::new().unwrap();
        let doc = parse_document(&p, "http://t.test/app/index.php", PAGE);
        assert_eq!(doc.title.as_deref(), Some("Admin Login"));
        assert_eq!(doc.links, vec![
            "http://t.test/about",
            "http://t.test/app/contact.php?x=1",
            "http://t.test/img/logo.png",
            "http://t.test/login",
        ]);
        assert_eq!(doc.forms.len(), 2);
        assert_eq!(doc.forms[0].action, "http://t.test/login");
        assert_eq!(doc.forms[0].method, "POST");
        assert_eq!(doc.forms[0].inputs, vec!["user", "pass", "lang"]);
        assert_eq!(doc.forms[1].action, "http://t.test/app/index.php");
        assert_eq!(doc.forms[1].method, "GET");
        assert_eq!(doc.forms[1].inputs, vec!["q"]);
    }

    #[test]
    fn worker_loop_answers_each_line() {
        let job = serde_json::to_string(&ParseJob {
            id: 7,
            base_url: "http://t.test/".to_string(),
            document: "<a href=\"x\">".to_string(),
        })
        .unwrap();
        let input = format!("{job}\nnot json\n");
        let mut out = Vec::new();
        run_worker_loop(input.as_bytes(), &mut out).unwrap();
        let replies: Vec<ParseReply> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].id, 7);
        assert_eq!(replies[0].document.as_ref().unwrap().links, vec!["http://t.test/x"]);
        assert!(replies[1].error.as_deref().unwrap().starts_with("malformed job"));
    }
}
