pub mod audit;
pub mod dom;
pub mod form;
#[cfg(feature = "portal")]
pub mod portal;

use form::{ActionDescriptor, ResolveError, ResolvedForm};
use url::Url;

/// Parse an HTML string and resolve the form for a portal action.
/// This is the primary pure entry point for aurum-core: no network is
/// touched, so the same inputs always produce the same result.
pub fn resolve_form(
    html: &str,
    base: &Url,
    action: &ActionDescriptor,
) -> Result<ResolvedForm, ResolveError> {
    let document = dom::parse_html(html);
    form::resolve(&document, base, action)
}
