pub mod delete_blob;
pub mod list_blobs;
pub mod put_blob;
pub mod read_blob;

pub use delete_blob::{
    DeleteBlobOperation, DeleteBlobOperationOutcome, DeleteBlobOperationRequest,
};
pub use list_blobs::{
    DEFAULT_LIST_LIMIT, ListBlobsOperation, ListBlobsOperationRequest, ListBlobsOperationResult,
    MAX_LIST_LIMIT,
};
pub use put_blob::{PutBlobOperation, PutBlobOperationRequest, PutBlobOperationResult};
pub use read_blob::{
    BlobBody, ByteRange, ReadBlobOperation, ReadBlobOperationOutcome, ReadBlobOperationRequest,
    ReadBlobOperationResult,
};

/// Whether an `If-Match` / `If-None-Match` header value matches `etag`.
///
/// `*` matches any existing representation. With `weak` set, `W/` prefixes
/// are ignored on both sides (the comparison `If-None-Match` uses).
pub fn etag_matches(header: &str, etag: &str, weak: bool) -> bool {
    let header = header.trim();
    if header == "*" {
        return true;
    }

    let normalize = |tag: &str| -> Option<String> {
        let tag = tag.trim();
        match tag.strip_prefix("W/") {
            Some(stripped) if weak => Some(stripped.to_string()),
            Some(_) => None,
            None => Some(tag.to_string()),
        }
    };

    let Some(current) = normalize(etag) else {
        return false;
    };

    header
        .split(',')
        .filter_map(normalize)
        .any(|candidate| candidate == current)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_matches() {
        let etag = "\"abc\"";
        assert!(etag_matches("*", etag, false));
        assert!(etag_matches("\"abc\"", etag, false));
        assert!(etag_matches("\"x\", \"abc\"", etag, false));
        assert!(!etag_matches("\"x\"", etag, false));
        assert!(!etag_matches("W/\"abc\"", etag, false));
        assert!(etag_matches("W/\"abc\"", etag, true));
    }
}
