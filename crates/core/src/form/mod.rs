//! Form resolution: locating the right form for a portal action inside one
//! rendered HTML document.
//!
//! The portal protects every mutating action with a rotating anti-forgery
//! token embedded in server-rendered markup, and the markup is not uniform
//! across action kinds. Resolution therefore runs through an ordered list of
//! matcher tiers and short-circuits on the first hit:
//!
//! 1. a `<form>` with a known, action-specific `id`;
//! 2. a `<form>` whose `action` attribute matches an action-specific pattern;
//! 3. a hidden token input located directly, with the submission target
//!    inferred from a nearby link;
//! 4. nothing matched: the markup has likely changed, and that is an error,
//!    never a guessed URL.
//!
//! Everything in this module is a pure function of (document, action): no
//! network, no globals, deterministic.

use crate::dom::DomNode;
use serde::{Deserialize, Serialize};
use url::Url;

/// Portal action a form is being resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Login,
    AddComment,
    EditComment,
    SubmitRequest,
}

/// Kind of package request the portal accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Orphan,
    Deletion,
    Merge,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Orphan => "orphan",
            RequestKind::Deletion => "deletion",
            RequestKind::Merge => "merge",
        }
    }
}

impl std::str::FromStr for RequestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "orphan" => Ok(RequestKind::Orphan),
            "deletion" | "delete" => Ok(RequestKind::Deletion),
            "merge" => Ok(RequestKind::Merge),
            other => Err(format!("unknown request kind: {}", other)),
        }
    }
}

/// Everything the resolver knows about one action kind's markup. The
/// literals here are the part of the portal contract most likely to drift;
/// keeping them in one table makes correcting them a data change.
pub(crate) struct FormSpec {
    /// Known `id` attributes for the form (tier 1).
    form_ids: &'static [&'static str],
    /// Substrings matched against the form `action` attribute (tier 2).
    action_patterns: &'static [&'static str],
    /// Names the hidden anti-forgery input goes by.
    token_names: &'static [&'static str],
    /// Substrings matched against link hrefs when inferring a target (tier 3).
    link_patterns: &'static [&'static str],
    /// Lowercase body substring confirming the action took effect.
    confirm_marker: Option<&'static str>,
}

impl ActionKind {
    pub(crate) fn form_spec(self) -> &'static FormSpec {
        match self {
            ActionKind::Login => &FormSpec {
                form_ids: &["login-form", "login"],
                action_patterns: &["/login"],
                token_names: &["token", "csrf_token"],
                link_patterns: &["/login"],
                confirm_marker: None,
            },
            ActionKind::AddComment => &FormSpec {
                form_ids: &["add-comment-form", "add-comment"],
                action_patterns: &["/comments"],
                token_names: &["token", "csrf_token"],
                link_patterns: &["#add-comment", "/comments"],
                confirm_marker: Some("comment has been added"),
            },
            ActionKind::EditComment => &FormSpec {
                form_ids: &["edit-comment-form", "edit-comment"],
                action_patterns: &["/edit", "edit-comment"],
                token_names: &["token", "csrf_token"],
                link_patterns: &["/edit", "edit-comment"],
                confirm_marker: Some("comment has been edited"),
            },
            ActionKind::SubmitRequest => &FormSpec {
                form_ids: &["request-form", "pkgreq-form"],
                action_patterns: &["/request"],
                token_names: &["token", "csrf_token"],
                link_patterns: &["/request"],
                confirm_marker: Some("added request successfully"),
            },
        }
    }

    /// Lowercase response-body substring that confirms the action, when the
    /// portal is known to emit one.
    pub fn confirm_marker(self) -> Option<&'static str> {
        self.form_spec().confirm_marker
    }
}

/// One requested portal action. Immutable, constructed per call.
#[derive(Debug, Clone)]
pub struct ActionDescriptor {
    pub kind: ActionKind,
    /// Package or package-base the action targets, when the kind needs one.
    pub package: Option<String>,
    /// Comment being edited, for `EditComment`.
    pub comment_id: Option<u64>,
    /// Caller-supplied payload fields; these win over resolved defaults on
    /// key collision.
    pub fields: Vec<(String, String)>,
}

impl ActionDescriptor {
    pub fn login() -> Self {
        Self {
            kind: ActionKind::Login,
            package: None,
            comment_id: None,
            fields: Vec::new(),
        }
    }

    pub fn add_comment(package: &str, text: &str) -> Self {
        Self {
            kind: ActionKind::AddComment,
            package: Some(package.to_string()),
            comment_id: None,
            fields: vec![("comment".to_string(), text.to_string())],
        }
    }

    pub fn edit_comment(package: &str, comment_id: u64, text: &str) -> Self {
        Self {
            kind: ActionKind::EditComment,
            package: Some(package.to_string()),
            comment_id: Some(comment_id),
            fields: vec![("comment".to_string(), text.to_string())],
        }
    }

    pub fn submit_request(
        package: &str,
        request: RequestKind,
        reason: &str,
        merge_into: Option<&str>,
    ) -> Self {
        let mut fields = vec![
            ("type".to_string(), request.as_str().to_string()),
            ("comments".to_string(), reason.to_string()),
        ];
        if let Some(target) = merge_into {
            fields.push(("merge_into".to_string(), target.to_string()));
        }
        Self {
            kind: ActionKind::SubmitRequest,
            package: Some(package.to_string()),
            comment_id: None,
            fields,
        }
    }

    /// Override or append a payload field. Portal-specific field names are
    /// defaults, not assumptions; callers adjust them here.
    pub fn with_field(mut self, name: &str, value: &str) -> Self {
        upsert_field(&mut self.fields, name, value.to_string());
        self
    }
}

/// A form located in one document, ready for a single submission. The
/// embedded token is assumed single-use: never cache or reuse a resolved
/// form across requests.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedForm {
    /// Absolute submission URL.
    pub action: Url,
    /// `name -> default value`, in document order.
    pub fields: Vec<(String, String)>,
    /// Name of the anti-forgery input, when one was found.
    pub token_field: Option<String>,
}

impl ResolvedForm {
    /// Resolved defaults with caller overrides applied. Overrides win on key
    /// collision and keep the original field's position; unknown keys are
    /// appended.
    pub fn merged_with(&self, overrides: &[(String, String)]) -> Vec<(String, String)> {
        let mut merged = self.fields.clone();
        for (name, value) in overrides {
            upsert_field(&mut merged, name, value.clone());
        }
        merged
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// No tier matched; the remote markup has likely changed.
    FormNotFound,
    /// A form matched but its submission target would not parse.
    InvalidTarget(String),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::FormNotFound => write!(f, "form not found"),
            ResolveError::InvalidTarget(t) => write!(f, "invalid form target: {}", t),
        }
    }
}

impl std::error::Error for ResolveError {}

/// Intermediate result of one matcher tier: the target as written in the
/// markup (possibly relative or empty) plus the extracted fields.
struct FormMatch {
    target: String,
    fields: Vec<(String, String)>,
    token_field: Option<String>,
}

/// Matcher tiers in priority order. Adding or reordering a tier is a data
/// change here, not a control-flow change.
const TIERS: &[fn(&DomNode, &FormSpec) -> Option<FormMatch>] = &[
    match_form_by_id,
    match_form_by_action,
    match_token_with_link,
];

/// Locate the form for `action` in `document` and resolve its submission
/// target against `base`.
pub fn resolve(
    document: &DomNode,
    base: &Url,
    action: &ActionDescriptor,
) -> Result<ResolvedForm, ResolveError> {
    let spec = action.kind.form_spec();
    let (tier, hit) = TIERS
        .iter()
        .enumerate()
        .find_map(|(i, tier)| tier(document, spec).map(|hit| (i + 1, hit)))
        .ok_or(ResolveError::FormNotFound)?;

    let mut target = base
        .join(hit.target.trim())
        .map_err(|e| ResolveError::InvalidTarget(format!("{}: {}", hit.target, e)))?;
    target.set_fragment(None);

    tracing::debug!(kind = ?action.kind, tier, action = %target, "form resolved");
    Ok(ResolvedForm {
        action: target,
        fields: hit.fields,
        token_field: hit.token_field,
    })
}

fn match_form_by_id(document: &DomNode, spec: &FormSpec) -> Option<FormMatch> {
    let form = document.find(&|n| {
        n.is_element("form")
            && n.get_attr("id")
                .map(|id| spec.form_ids.contains(&id))
                .unwrap_or(false)
    })?;
    Some(form_match(form, spec))
}

fn match_form_by_action(document: &DomNode, spec: &FormSpec) -> Option<FormMatch> {
    let form = document.find(&|n| {
        n.is_element("form")
            && n.get_attr("action")
                .map(|a| spec.action_patterns.iter().any(|p| a.contains(p)))
                .unwrap_or(false)
    })?;
    Some(form_match(form, spec))
}

/// Last resort: the token input exists but its form is not identifiable.
/// Infer the submission target from the first link matching the kind's
/// patterns and carry every hidden input so the submission echoes what the
/// page embedded.
fn match_token_with_link(document: &DomNode, spec: &FormSpec) -> Option<FormMatch> {
    let token = document.find(&|n| {
        is_hidden_input(n)
            && n.get_attr("name")
                .map(|name| spec.token_names.contains(&name))
                .unwrap_or(false)
    })?;
    let link = document.find(&|n| {
        n.is_element("a")
            && n.get_attr("href")
                .map(|h| spec.link_patterns.iter().any(|p| h.contains(p)))
                .unwrap_or(false)
    })?;

    let mut fields = Vec::new();
    for input in document.find_all(&|n| is_hidden_input(n)) {
        if let Some(name) = input.get_attr("name") {
            upsert_field(
                &mut fields,
                name,
                input.get_attr("value").unwrap_or("").to_string(),
            );
        }
    }
    let token_field = token.get_attr("name").map(|s| s.to_string());

    Some(FormMatch {
        target: link.get_attr("href").unwrap_or("").to_string(),
        fields,
        token_field,
    })
}

fn is_hidden_input(node: &DomNode) -> bool {
    node.is_element("input")
        && node
            .get_attr("type")
            .map(|t| t.eq_ignore_ascii_case("hidden"))
            .unwrap_or(false)
}

fn form_match(form: &DomNode, spec: &FormSpec) -> FormMatch {
    let fields = collect_fields(form);
    let token_field = fields
        .iter()
        .map(|(name, _)| name)
        .find(|name| spec.token_names.contains(&name.as_str()))
        .cloned();
    FormMatch {
        target: form.get_attr("action").unwrap_or("").to_string(),
        fields,
        token_field,
    }
}

/// Every named `<input>`, `<textarea>`, and `<select>` inside the form
/// contributes `name -> default value` in document order. Checkboxes and
/// radios contribute only when checked, matching what a browser would
/// submit.
fn collect_fields(form: &DomNode) -> Vec<(String, String)> {
    let mut fields = Vec::new();
    collect_fields_into(form, &mut fields);
    fields
}

fn collect_fields_into(node: &DomNode, fields: &mut Vec<(String, String)>) {
    if node.is_element("input") {
        if let Some(name) = node.get_attr("name") {
            let input_type = node.get_attr("type").unwrap_or("text");
            let checkable = input_type.eq_ignore_ascii_case("checkbox")
                || input_type.eq_ignore_ascii_case("radio");
            if !checkable || node.get_attr("checked").is_some() {
                // checked controls submit "on" when the markup gives no value
                let default = if checkable { "on" } else { "" };
                let value = node.get_attr("value").unwrap_or(default).to_string();
                upsert_field(fields, name, value);
            }
        }
    } else if node.is_element("textarea") {
        if let Some(name) = node.get_attr("name") {
            upsert_field(fields, name, node.text_content());
        }
    } else if node.is_element("select") {
        if let Some(name) = node.get_attr("name") {
            upsert_field(fields, name, selected_option_value(node));
        }
    }

    for child in &node.children {
        collect_fields_into(child, fields);
    }
}

/// The `selected` option's value, else the first option's, else empty:
/// the same default a browser would submit.
fn selected_option_value(select: &DomNode) -> String {
    let options = select.find_all(&|n| n.is_element("option"));
    let chosen = options
        .iter()
        .find(|o| o.get_attr("selected").is_some())
        .or_else(|| options.first());
    match chosen {
        Some(option) => option
            .get_attr("value")
            .map(|v| v.to_string())
            .unwrap_or_else(|| option.text_content()),
        None => String::new(),
    }
}

/// Duplicate names keep their first position; later values overwrite.
fn upsert_field(fields: &mut Vec<(String, String)>, name: &str, value: String) {
    match fields.iter_mut().find(|(n, _)| n == name) {
        Some(slot) => slot.1 = value,
        None => fields.push((name.to_string(), value)),
    }
}
