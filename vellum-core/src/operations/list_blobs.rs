use crate::{BlobMetadata, Result, Storage};

pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct ListBlobsOperation {
    storage: Storage,
}

#[derive(Debug, Clone, Default)]
pub struct ListBlobsOperationRequest {
    pub prefix: String,
    /// Resume strictly after this key.
    pub after: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ListBlobsOperationResult {
    pub items: Vec<BlobMetadata>,
    /// Key to pass as `after` for the next page, when more live keys exist.
    pub next_page: Option<String>,
}

impl ListBlobsOperation {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub async fn run(&self, request: ListBlobsOperationRequest) -> Result<ListBlobsOperationResult> {
        let ListBlobsOperationRequest {
            prefix,
            after,
            limit,
        } = request;
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

        self.storage
            .index
            .blocking(move |index| {
                let mut live = index
                    .list_from(&prefix, after)
                    .filter(|meta| !matches!(meta, Ok(meta) if meta.is_tombstoned()));

                let mut items = Vec::with_capacity(limit.min(64));
                for meta in live.by_ref().take(limit) {
                    items.push(meta?);
                }

                let has_more = match live.next() {
                    Some(next) => {
                        next?;
                        true
                    }
                    None => false,
                };
                let next_page = if has_more {
                    items.last().map(|meta| meta.key.to_string())
                } else {
                    None
                };

                Ok(ListBlobsOperationResult { items, next_page })
            })
            .await
    }
}
