use crate::api::RemoteApi;
use crate::errors::{AppError, AppResult};
use crate::models::{Record, Table};

/// Every row of a remote collection gathered through `skip`/`take` listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Collected<T> {
    pub results: Vec<T>,
    pub total: u64,
    pub requests: u32,
}

/// Walks `skip`/`take` pages until the reported total is reached or a page
/// comes back empty.
pub async fn collect_pages(
    api: &dyn RemoteApi,
    table: Table,
    page_size: u32,
) -> AppResult<Collected<serde_json::Value>> {
    let take = page_size.max(1);
    let mut results: Vec<serde_json::Value> = Vec::new();
    let mut requests = 0;

    loop {
        let page = api.list(table, results.len() as u64, take).await?;
        requests += 1;
        let fetched = page.results.len();
        results.extend(page.results);
        if fetched == 0 || results.len() as u64 >= page.total {
            return Ok(Collected {
                results,
                total: page.total,
                requests,
            });
        }
    }
}

/// Typed variant of [`collect_pages`] for one synced table.
pub async fn load_remote<R: Record>(api: &dyn RemoteApi, page_size: u32) -> AppResult<Collected<R>> {
    let collected = collect_pages(api, R::TABLE, page_size).await?;
    let results = collected
        .results
        .into_iter()
        .map(|row| {
            serde_json::from_value::<R>(row)
                .map_err(|err| AppError::Internal(format!("malformed {} row: {}", R::TABLE, err)))
        })
        .collect::<AppResult<Vec<_>>>()?;
    Ok(Collected {
        results,
        total: collected.total,
        requests: collected.requests,
    })
}

#[cfg(test)]
mod tests {
    use super::{collect_pages, load_remote};
    use crate::api::memory::{ApiOperation, InMemoryApi};
    use crate::api::RemoteApi;
    use crate::models::{Artifact, Table};
    use std::collections::HashSet;

    fn seeded(count: usize) -> InMemoryApi {
        let api = InMemoryApi::new();
        api.insert_rows(
            Table::Artifacts,
            (0..count).map(|i| serde_json::json!({ "id": format!("art-{:03}", i), "modifiedDate": "2026-03-01" })),
        );
        api
    }

    #[tokio::test]
    async fn skip_take_pages_are_disjoint_and_sum_to_total() {
        let api = seeded(120);
        let mut seen = HashSet::new();
        let mut sizes = Vec::new();
        for skip in [0, 50, 100] {
            let page = api.list(Table::Artifacts, skip, 50).await.expect("page");
            assert_eq!(page.total, 120);
            sizes.push(page.results.len());
            for row in page.results {
                assert!(seen.insert(row["id"].as_str().unwrap_or_default().to_string()));
            }
        }
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(seen.len(), 120);
    }

    #[tokio::test]
    async fn collects_every_page() {
        let api = seeded(120);
        let collected = collect_pages(&api, Table::Artifacts, 50).await.expect("collect");
        assert_eq!(collected.results.len(), 120);
        assert_eq!(collected.total, 120);
        assert_eq!(collected.requests, 3);
        assert_eq!(api.call_count(ApiOperation::List), 3);

        let typed = load_remote::<Artifact>(&api, 50).await.expect("typed");
        assert_eq!(typed.results[119].id, "art-119");
    }

    #[tokio::test]
    async fn empty_collection_takes_one_request() {
        let api = InMemoryApi::new();
        let collected = collect_pages(&api, Table::Assets, 50).await.expect("collect");
        assert!(collected.results.is_empty());
        assert_eq!(collected.requests, 1);
    }
}
