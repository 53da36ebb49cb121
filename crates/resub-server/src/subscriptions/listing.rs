//! Cursor-paginated resource listing.
//!
//! Resources are ordered by URI. A cursor is the URL-safe base64 of the last
//! URI on the previous page, so pages stay stable while resources are added.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;

use super::error::{SubscriptionError, SubscriptionResult};
use super::provider::ResourceDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourcePage {
    pub resources: Vec<ResourceDescriptor>,
    #[serde(rename = "nextCursor", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

pub fn encode_cursor(uri: &str) -> String {
    URL_SAFE_NO_PAD.encode(uri.as_bytes())
}

pub fn decode_cursor(cursor: &str) -> SubscriptionResult<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| SubscriptionError::InvalidCursor)?;
    String::from_utf8(bytes).map_err(|_| SubscriptionError::InvalidCursor)
}

/// Return up to `limit` resources after `cursor`.
pub fn paginate(
    mut resources: Vec<ResourceDescriptor>,
    limit: usize,
    cursor: Option<&str>,
) -> SubscriptionResult<ResourcePage> {
    let after = cursor.map(decode_cursor).transpose()?;
    resources.sort_by(|a, b| a.uri.cmp(&b.uri));

    let start = match &after {
        Some(after) => resources.partition_point(|r| r.uri.as_str() <= after.as_str()),
        None => 0,
    };
    let remaining = resources.len().saturating_sub(start);
    let page: Vec<ResourceDescriptor> = resources.into_iter().skip(start).take(limit).collect();

    let next_cursor = if remaining > page.len() {
        page.last().map(|r| encode_cursor(&r.uri))
    } else {
        None
    };
    Ok(ResourcePage {
        resources: page,
        next_cursor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(uris: &[&str]) -> Vec<ResourceDescriptor> {
        uris.iter().map(|u| ResourceDescriptor::new(*u)).collect()
    }

    #[test]
    fn walks_pages_in_uri_order() {
        let all = resources(&["file:///c", "file:///a", "file:///d", "file:///b", "file:///e"]);

        let first = paginate(all.clone(), 2, None).unwrap();
        assert_eq!(first.resources[0].uri, "file:///a");
        assert_eq!(first.resources[1].uri, "file:///b");
        let cursor = first.next_cursor.unwrap();

        let second = paginate(all.clone(), 2, Some(&cursor)).unwrap();
        assert_eq!(second.resources[0].uri, "file:///c");
        let cursor = second.next_cursor.unwrap();

        let last = paginate(all, 2, Some(&cursor)).unwrap();
        assert_eq!(last.resources.len(), 1);
        assert_eq!(last.resources[0].uri, "file:///e");
        assert!(last.next_cursor.is_none());
    }

    #[test]
    fn exact_fit_has_no_next_cursor() {
        let page = paginate(resources(&["a", "b"]), 2, None).unwrap();
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn garbage_cursor_is_rejected() {
        let err = paginate(resources(&["a"]), 2, Some("!!not base64!!")).unwrap_err();
        assert!(matches!(err, SubscriptionError::InvalidCursor));
    }
}
