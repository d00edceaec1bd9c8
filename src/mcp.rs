use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router, ServerHandler,
};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::config::RunConfig;
use crate::controller::Controller;
use crate::driver::EokaDriver;
use crate::Error;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SelectRequest {
    #[schemars(description = "Element index from scan")]
    pub index: usize,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SetTargetRequest {
    #[schemars(description = "URL of the page carrying the clickable target")]
    pub url: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct FindRequest {
    #[schemars(description = "Text substring to search for (case-insensitive)")]
    pub text: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SetIntervalRequest {
    #[schemars(description = "Seconds between click attempts (minimum 1)")]
    pub secs: u64,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

fn err(e: Error) -> ErrorData {
    match e {
        Error::InvalidInterval(_) | Error::UnknownElement(_) => {
            ErrorData::invalid_params(e.to_string(), None::<Value>)
        }
        other => ErrorData::internal_error(other.to_string(), None::<Value>),
    }
}

fn text_ok(s: impl Into<String>) -> Result<CallToolResult, ErrorData> {
    Ok(CallToolResult::success(vec![Content::text(s.into())]))
}

#[derive(Clone)]
pub struct GrabServer {
    controller: Arc<Controller<EokaDriver>>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl GrabServer {
    pub fn new(config: RunConfig) -> Self {
        let factory = EokaDriver::factory(config.browser.clone());
        Self {
            controller: Arc::new(Controller::new(factory, &config)),
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Step 1: open the browser on the login page. Log in manually in the opened window, then move on to scan. Unlocks scanning."
    )]
    async fn open_login(&self) -> Result<CallToolResult, ErrorData> {
        self.controller.open_login().await.map_err(err)?;
        text_ok("Browser open on the login page. Log in manually, then run scan.")
    }

    #[tool(
        description = "Step 2: navigate to the target page and list its clickable elements. Returns a compact indexed list. Must run before select."
    )]
    async fn scan(&self) -> Result<CallToolResult, ErrorData> {
        let catalog = self.controller.scan().await.map_err(err)?;
        if catalog.is_empty() {
            return text_ok("No clickable elements found. The page may still be loading; scan again.");
        }
        let likely = catalog.likely_slots();
        let mut out = catalog.listing();
        if !likely.is_empty() {
            out.push_str(&format!("\nLikely booking targets: {likely:?}\n"));
        }
        text_ok(out)
    }

    #[tool(
        description = "Step 2: arm one scanned element as the click target by index. Unlocks the auto-click loop."
    )]
    async fn select(&self, req: Parameters<SelectRequest>) -> Result<CallToolResult, ErrorData> {
        let selection = self.controller.select(req.0.index).map_err(err)?;
        text_ok(format!(
            "Armed on [{}] \"{}\". Use enable to start the loop or test_click to try once.",
            req.0.index, selection.label
        ))
    }

    #[tool(
        description = "Try one click against the armed target right now. Reports whether the target was present and clicked."
    )]
    async fn test_click(&self) -> Result<CallToolResult, ErrorData> {
        let clicked = self.controller.test_click().await.map_err(err)?;
        text_ok(if clicked {
            "Clicked the armed target."
        } else {
            "Target not present on the page right now. Nothing was clicked."
        })
    }

    #[tool(description = "Change the target page URL. Applies to the next scan or enable.")]
    async fn set_target(
        &self,
        req: Parameters<SetTargetRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        self.controller.set_target_url(&req.0.url).map_err(err)?;
        text_ok(format!("Target page set to {}.", req.0.url))
    }

    #[tool(description = "Set the seconds between auto-click attempts (minimum 1). Applies to the next enable.")]
    async fn set_interval(
        &self,
        req: Parameters<SetIntervalRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        self.controller.set_interval(req.0.secs).map_err(err)?;
        text_ok(format!("Interval set to {}s.", req.0.secs))
    }

    #[tool(
        description = "Step 3: start the auto-click loop. It retries until the target appears, clicks it once, and stops. Transient page errors are absorbed."
    )]
    async fn enable(&self) -> Result<CallToolResult, ErrorData> {
        self.controller.enable_loop().map_err(err)?;
        let interval = self.controller.interval_secs();
        text_ok(format!(
            "Auto-click loop running, one attempt every {interval}s. Watch status for progress."
        ))
    }

    #[tool(description = "Stop the auto-click loop. Takes effect at the next attempt boundary.")]
    async fn disable(&self) -> Result<CallToolResult, ErrorData> {
        self.controller.disable_loop();
        text_ok("Stop requested. The loop halts at the next attempt boundary.")
    }

    #[tool(
        description = "Find scanned elements whose label contains a substring (case-insensitive). Searches the last scan results."
    )]
    async fn find(&self, req: Parameters<FindRequest>) -> Result<CallToolResult, ErrorData> {
        let catalog = self.controller.catalog();
        if catalog.is_empty() {
            return Err(ErrorData::internal_error(
                "No scan results. Run scan first.",
                None::<Value>,
            ));
        }
        match catalog.find_by_text(&req.0.text) {
            Some(index) => {
                let el = catalog.get(index).map(|e| e.to_string()).unwrap_or_default();
                text_ok(el)
            }
            None => text_ok(format!("No elements found matching \"{}\"", req.0.text)),
        }
    }

    #[tool(description = "Current workflow state: step gate, loop progress, attempts, and next tick.")]
    async fn status(&self) -> Result<CallToolResult, ErrorData> {
        let gate = self.controller.gate_state();
        let state = self.controller.loop_state();
        let mut out = format!(
            "Gate: {gate:?}\nLoop: {} ({})\nAttempts: {}\nInterval: {}s\n",
            if state.enabled { "running" } else { "idle" },
            state.outcome.as_str(),
            state.attempt_count,
            state.interval_secs,
        );
        if let Some(selection) = self.controller.selection() {
            out.push_str(&format!("Armed target: \"{}\"\n", selection.label));
        }
        if let Some(secs) = self.controller.seconds_until_next_tick() {
            out.push_str(&format!("Next attempt in: {secs}s\n"));
        }
        if let Some(e) = state.last_error {
            out.push_str(&format!("Last absorbed error: {e}\n"));
        }
        if let Some(at) = state.last_attempt {
            out.push_str(&format!("Last attempt at: {}\n", at.to_rfc3339()));
        }
        if self.controller.left_login_page().await {
            out.push_str("Login page: left (informational only)\n");
        }
        text_ok(out)
    }

    #[tool(description = "Relist the most recent scan results without rescanning.")]
    async fn catalog(&self) -> Result<CallToolResult, ErrorData> {
        let catalog = self.controller.catalog();
        text_ok(if catalog.is_empty() {
            "No scan results. Run scan first.".to_string()
        } else {
            catalog.listing()
        })
    }

    #[tool(
        description = "Return the screenshot captured right after the successful click, as base64 PNG. Empty until the loop clicks."
    )]
    async fn screenshot(&self) -> Result<CallToolResult, ErrorData> {
        match self.controller.loop_state().last_screenshot {
            Some(shot) => {
                let b64 = BASE64.encode(&shot.png);
                Ok(CallToolResult::success(vec![
                    Content::image(b64, "image/png"),
                    Content::text(format!("Captured at {}", shot.taken_at.to_rfc3339())),
                ]))
            }
            None => text_ok("No click screenshot captured yet."),
        }
    }

    #[tool(description = "Stop the loop, close the browser, and re-lock the workflow at step 1.")]
    async fn close(&self) -> Result<CallToolResult, ErrorData> {
        self.controller.close().await;
        text_ok("Browser closed. Workflow re-locked at step 1.")
    }
}

#[tool_handler]
impl ServerHandler for GrabServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "grabit".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Booking-slot grabber with a gated three-step workflow. \
                 Step 1: 'open_login' opens a browser; log in manually there. \
                 Step 2: 'scan' lists clickable elements on the target page, 'select' arms one by index. \
                 Step 3: 'enable' starts a self-paced loop that clicks the target the moment it appears, then stops. \
                 'status' reports progress, 'test_click' tries once, 'disable' stops the loop, \
                 'screenshot' returns the post-click capture. Steps are locked until the previous one succeeds."
                    .into(),
            ),
        }
    }
}

pub async fn run_server(config: RunConfig) -> anyhow::Result<()> {
    use rmcp::ServiceExt;

    let server = GrabServer::new(config);
    let service = server.serve(rmcp::transport::stdio()).await?;
    service.waiting().await?;
    Ok(())
}
