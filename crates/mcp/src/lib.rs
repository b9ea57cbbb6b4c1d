//! MCP server for aurum: exposes AUR portal operations as tools over stdio.

use std::sync::{Arc, Mutex, MutexGuard};

use aurum_core::audit;
use aurum_core::form::{ActionDescriptor, RequestKind};
use aurum_core::portal::{Credentials, OperationResult, PortalError, Session};

use rmcp::{
    handler::server::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler,
};

use serde::Deserialize;

// --- Parameter structs ---

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct AuditParams {
    #[schemars(description = "Full text of the PKGBUILD to audit")]
    pub content: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct CommentsParams {
    #[schemars(description = "Name of the AUR package")]
    pub package: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct NewsParams {
    #[schemars(description = "Number of articles to fetch with full content (default 5)")]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct PackageInfoParams {
    #[schemars(description = "Name of the AUR package")]
    pub package: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct PostCommentParams {
    #[schemars(description = "Name of the AUR package")]
    pub package: String,
    #[schemars(description = "Comment text to post")]
    pub comment: String,
    #[schemars(description = "Portal username (falls back to AUR_USERNAME)")]
    pub username: Option<String>,
    #[schemars(description = "Portal password (falls back to AUR_PASSWORD)")]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct EditCommentParams {
    #[schemars(description = "Name of the AUR package")]
    pub package: String,
    #[schemars(description = "Numeric id of the comment to edit")]
    pub comment_id: u64,
    #[schemars(description = "Replacement comment text")]
    pub comment: String,
    #[schemars(description = "Portal username (falls back to AUR_USERNAME)")]
    pub username: Option<String>,
    #[schemars(description = "Portal password (falls back to AUR_PASSWORD)")]
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct SubmitRequestParams {
    #[schemars(description = "Name of the AUR package base")]
    pub package: String,
    #[schemars(description = "Request kind: 'orphan', 'deletion', or 'merge'")]
    pub kind: String,
    #[schemars(description = "Reason shown to the package maintainers")]
    pub reason: String,
    #[schemars(description = "Merge target package (merge requests only)")]
    pub merge_into: Option<String>,
    #[schemars(description = "Portal username (falls back to AUR_USERNAME)")]
    pub username: Option<String>,
    #[schemars(description = "Portal password (falls back to AUR_PASSWORD)")]
    pub password: Option<String>,
}

// --- Helpers ---

fn err(msg: impl Into<String>) -> McpError {
    McpError::new(rmcp::model::ErrorCode::INVALID_PARAMS, msg.into(), None)
}

fn map_portal_error(e: PortalError) -> McpError {
    match &e {
        PortalError::InvalidUrl(_) | PortalError::NotFound(_) => {
            McpError::new(rmcp::model::ErrorCode::INVALID_PARAMS, e.to_string(), None)
        }
        PortalError::Network(_)
        | PortalError::HttpStatus { .. }
        | PortalError::ResponseTooLarge(_)
        | PortalError::Decode(_) => {
            McpError::new(rmcp::model::ErrorCode::INTERNAL_ERROR, e.to_string(), None)
        }
    }
}

fn json_result<T: serde::Serialize>(value: &T) -> CallToolResult {
    let json = serde_json::to_string_pretty(value).unwrap_or_default();
    CallToolResult::success(vec![Content::text(json)])
}

/// Resolve credentials from call parameters, falling back to the process
/// environment. The core never reads the environment; that is this
/// dispatcher's job.
fn credentials_from(username: Option<String>, password: Option<String>) -> Result<Credentials, McpError> {
    let username = username
        .or_else(|| std::env::var("AUR_USERNAME").ok())
        .ok_or_else(|| err("username not provided and AUR_USERNAME unset"))?;
    let secret = password
        .or_else(|| std::env::var("AUR_PASSWORD").ok())
        .ok_or_else(|| err("password not provided and AUR_PASSWORD unset"))?;
    Ok(Credentials { username, secret })
}

/// Boundary fallback for failures that should never happen: logged to the
/// diagnostic channel, surfaced as a structured transport failure.
fn internal_failure() -> CallToolResult {
    json_result(&OperationResult::TransportFailure {
        reason: "internal".to_string(),
    })
}

// --- Server ---

#[derive(Clone)]
pub struct AurumServer {
    session: Arc<Mutex<Session>>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl AurumServer {
    pub fn with_session(session: Arc<Mutex<Session>>) -> Self {
        Self {
            session,
            tool_router: Self::tool_router(),
        }
    }

    fn lock_session(&self) -> Option<MutexGuard<'_, Session>> {
        match self.session.lock() {
            Ok(guard) => Some(guard),
            Err(poisoned) => {
                tracing::error!("portal session mutex poisoned");
                drop(poisoned);
                None
            }
        }
    }

    #[tool(description = "Audit a PKGBUILD for dangerous shell patterns. Returns an ordered list of findings; an empty list means no rule matched.")]
    pub async fn audit_pkgbuild(
        &self,
        Parameters(params): Parameters<AuditParams>,
    ) -> Result<CallToolResult, McpError> {
        let findings = audit::audit(&params.content);
        Ok(json_result(&findings))
    }

    #[tool(description = "Fetch the comments shown on an AUR package page. No login required.")]
    pub async fn get_comments(
        &self,
        Parameters(params): Parameters<CommentsParams>,
    ) -> Result<CallToolResult, McpError> {
        let Some(mut session) = self.lock_session() else {
            return Ok(internal_failure());
        };
        let comments = session.comments(&params.package).map_err(map_portal_error)?;
        Ok(json_result(&comments))
    }

    #[tool(description = "Fetch the latest Arch Linux news articles with full content.")]
    pub async fn get_news(
        &self,
        Parameters(params): Parameters<NewsParams>,
    ) -> Result<CallToolResult, McpError> {
        let Some(mut session) = self.lock_session() else {
            return Ok(internal_failure());
        };
        let items = session
            .news(params.limit.unwrap_or(5))
            .map_err(map_portal_error)?;
        Ok(json_result(&items))
    }

    #[tool(description = "Fetch AUR package metadata (version, maintainer, votes) from the RPC endpoint.")]
    pub async fn get_package_info(
        &self,
        Parameters(params): Parameters<PackageInfoParams>,
    ) -> Result<CallToolResult, McpError> {
        let Some(mut session) = self.lock_session() else {
            return Ok(internal_failure());
        };
        let info = session.package_info(&params.package).map_err(map_portal_error)?;
        Ok(json_result(&info))
    }

    #[tool(description = "Post a comment on an AUR package page. Logs in, resolves the comment form and its anti-forgery token, submits. Returns a structured OperationResult.")]
    pub async fn post_comment(
        &self,
        Parameters(params): Parameters<PostCommentParams>,
    ) -> Result<CallToolResult, McpError> {
        let credentials = credentials_from(params.username, params.password)?;
        let action = ActionDescriptor::add_comment(&params.package, &params.comment);
        let Some(mut session) = self.lock_session() else {
            return Ok(internal_failure());
        };
        let result = session.login_and_perform(&credentials, &action);
        Ok(json_result(&result))
    }

    #[tool(description = "Edit an existing comment on an AUR package. Returns a structured OperationResult.")]
    pub async fn edit_comment(
        &self,
        Parameters(params): Parameters<EditCommentParams>,
    ) -> Result<CallToolResult, McpError> {
        let credentials = credentials_from(params.username, params.password)?;
        let action =
            ActionDescriptor::edit_comment(&params.package, params.comment_id, &params.comment);
        let Some(mut session) = self.lock_session() else {
            return Ok(internal_failure());
        };
        let result = session.login_and_perform(&credentials, &action);
        Ok(json_result(&result))
    }

    #[tool(description = "File an orphan, deletion, or merge request for an AUR package base. Returns a structured OperationResult.")]
    pub async fn submit_request(
        &self,
        Parameters(params): Parameters<SubmitRequestParams>,
    ) -> Result<CallToolResult, McpError> {
        let kind: RequestKind = params.kind.parse().map_err(err)?;
        if kind == RequestKind::Merge && params.merge_into.is_none() {
            return Err(err("merge requests need merge_into"));
        }
        let credentials = credentials_from(params.username, params.password)?;
        let action = ActionDescriptor::submit_request(
            &params.package,
            kind,
            &params.reason,
            params.merge_into.as_deref(),
        );
        let Some(mut session) = self.lock_session() else {
            return Ok(internal_failure());
        };
        let result = session.login_and_perform(&credentials, &action);
        Ok(json_result(&result))
    }
}

#[tool_handler]
impl ServerHandler for AurumServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "aurum: AUR portal tools. audit_pkgbuild checks build recipes for \
                 dangerous shell patterns. get_comments/get_news/get_package_info are \
                 read-only. post_comment, edit_comment, and submit_request log in and \
                 submit portal forms; they return a JSON OperationResult whose status is \
                 success, auth_failure, resolution_failure, or transport_failure. A \
                 success with detail 'unconfirmed' means the portal accepted the request \
                 but the confirmation marker was not seen."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "aurum-mcp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
