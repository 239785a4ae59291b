use async_trait::async_trait;
use url::form_urlencoded;

use super::{Capabilities, Plugin, PluginContext, PluginError};
use crate::model::{FetchRequest, FetchResult, WorkItem};
use crate::parser::Form;

const NAME: &str = "web_spider";
const FILL_VALUE: &str = "scanline";

/// Follows links and submits forms found in HTML responses.
#[derive(Default)]
pub struct WebSpider;

impl WebSpider {
    pub fn new() -> Self {
        Self
    }
}

fn form_request(form: &Form, parent: &FetchRequest) -> Option<FetchRequest> {
    let fields = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(form.inputs.iter().map(|name| (name.as_str(), FILL_VALUE)))
        .finish();
    let request = if form.method == "POST" {
        FetchRequest::new("POST", &form.action)
            .ok()?
            .with_header("Content-Type", "application/x-www-form-urlencoded")
            .with_body(fields)
    } else {
        let mut url = url::Url::parse(&form.action).ok()?;
        if !fields.is_empty() {
            url.set_query(Some(&fields));
        }
        FetchRequest::get(url.as_str()).ok()?
    };
    Some(request.linked_from(parent))
}

#[async_trait]
impl Plugin for WebSpider {
    fn name(&self) -> &str {
        NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::DISCOVER
    }

    async fn discover(
        &self,
        ctx: &PluginContext,
        exchange: &FetchResult,
    ) -> Result<Vec<WorkItem>, PluginError> {
        if !exchange.response.is_html() {
            return Ok(Vec::new());
        }
        let doc = ctx.parse(exchange).await?;
        let mut items: Vec<WorkItem> = doc
            .links
            .iter()
            .filter_map(|link| FetchRequest::get(link).ok())
            .map(|req| WorkItem::Fetch(req.linked_from(&exchange.request)))
            .collect();
        items.extend(
            doc.forms
                .iter()
                .filter_map(|form| form_request(form, &exchange.request))
                .map(WorkItem::Fetch),
        );
        Ok(items)
    }
}
