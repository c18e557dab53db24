use searchdocs_core::{
    CharacterNgramEmbedder, HybridRetriever, IndexController, IngestionOptions, MemoryTermIndex,
    MemoryVectorStore, RunRecordStore, SearchMode, SearchQuery,
};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

const PUMP: &str = "# Hydraulic pump service\n\n\
Replace the hydraulic pump shaft seal every two thousand operating hours. \
Check the pump housing for cavitation damage and record the discharge pressure.";

const TRAVEL: &str = "Travel expense policy. Employees book economy class flights \
and submit hotel receipts within thirty days of returning.";

#[tokio::test]
async fn duplicate_pair_is_indexed_once_and_unique_document_ranks_first(
) -> Result<(), Box<dyn std::error::Error>> {
    let docs = tempdir()?;
    fs::write(docs.path().join("pump.md"), PUMP)?;
    fs::write(docs.path().join("travel.txt"), TRAVEL)?;
    fs::create_dir(docs.path().join("archive"))?;
    fs::write(docs.path().join("archive").join("travel-copy.txt"), TRAVEL)?;

    let state = tempdir()?;
    let run_record = RunRecordStore::new(state.path().join("run_record.json"));
    let terms = Arc::new(MemoryTermIndex::new());
    let vectors = Arc::new(MemoryVectorStore::new());
    let embedder = Arc::new(CharacterNgramEmbedder::new(128));

    let controller = IndexController::new(terms.clone(), vectors.clone(), embedder.clone())?;
    let summary = controller
        .run(docs.path(), &IngestionOptions::default(), Some(&run_record))
        .await?;

    assert_eq!(summary.discovered, 3);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.skipped_duplicate, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(terms.len(), 2);
    assert_eq!(vectors.document_ids().len(), 2);
    assert!(run_record.load().await?.last_successful_run.is_some());

    let retriever = HybridRetriever::new(terms.clone(), vectors.clone(), embedder);
    let result = retriever
        .search(&SearchQuery::new("hydraulic pump seal replacement", 5))
        .await?;

    let first = result.hits.first().ok_or("no hits")?;
    assert!(first.source_path.ends_with("pump.md"));
    assert_eq!(first.modes, vec![SearchMode::Lexical, SearchMode::Vector]);
    assert_eq!(first.title.as_deref(), Some("Hydraulic pump service"));
    assert!(result.degraded.is_none());
    Ok(())
}

#[tokio::test]
async fn second_run_changes_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let docs = tempdir()?;
    fs::write(docs.path().join("pump.md"), PUMP)?;
    fs::write(docs.path().join("travel.txt"), TRAVEL)?;

    let terms = Arc::new(MemoryTermIndex::new());
    let vectors = Arc::new(MemoryVectorStore::new());
    let controller = IndexController::new(
        terms.clone(),
        vectors.clone(),
        Arc::new(CharacterNgramEmbedder::new(128)),
    )?;

    controller.run(docs.path(), &IngestionOptions::default(), None).await?;
    let entries_before = terms.entries();
    let vectors_before = vectors.len();

    let second = controller.run(docs.path(), &IngestionOptions::default(), None).await?;
    assert_eq!(second.processed, 0);
    assert_eq!(second.skipped_duplicate, 2);
    assert_eq!(terms.entries(), entries_before);
    assert_eq!(vectors.len(), vectors_before);
    Ok(())
}
