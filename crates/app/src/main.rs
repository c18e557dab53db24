use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use searchdocs_core::{
    is_question, parse_prevrun_dt, CancellationFlag, CharRatioTokenCounter, CharacterNgramEmbedder,
    ChunkingConfig, Embedder, FusionWeights, HttpClientConfig, HttpEmbedder, HttpGenerator,
    HybridRetriever, IndexController, IngestionOptions, ModelTokenCounter, OpenSearchTermIndex,
    QdrantVectorStore,
    RagAnswer, RagConfig, RagPipeline, RetrievalConfig, RetrievalResult, RunRecordStore,
    SearchQuery, TokenCounter, WhitespaceTokenCounter,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum YesNo {
    #[value(name = "y", alias = "yes")]
    Yes,
    #[value(name = "n", alias = "no")]
    No,
}

impl YesNo {
    fn enabled(self) -> bool {
        self == YesNo::Yes
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TokenEstimate {
    /// One token per whitespace-separated word.
    Words,
    /// One token per four characters of each word.
    Chars,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Summarize {
    Never,
    /// Only for queries that read like a question or an instruction.
    Auto,
    Always,
}

#[derive(Parser)]
#[command(name = "searchdocs", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// OpenSearch base URL
    #[arg(long, env = "OPENSEARCH_URL", default_value = "http://localhost:9200", global = true)]
    opensearch_url: String,

    /// OpenSearch index name
    #[arg(long, env = "SEARCHDOCS_INDEX", default_value = "searchdocs", global = true)]
    opensearch_index: String,

    /// Qdrant base URL
    #[arg(long, env = "QDRANT_URL", default_value = "http://localhost:6333", global = true)]
    qdrant_url: String,

    /// Qdrant collection
    #[arg(long, env = "SEARCHDOCS_COLLECTION", default_value = "searchdocs", global = true)]
    qdrant_collection: String,

    /// OpenAI-compatible embedding service; the local n-gram embedder is used when unset.
    #[arg(long, env = "SEARCHDOCS_EMBEDDING_URL", global = true)]
    embedding_url: Option<String>,

    #[arg(long, env = "SEARCHDOCS_EMBEDDING_MODEL", default_value = "all-MiniLM-L6-v2", global = true)]
    embedding_model: String,

    #[arg(long, env = "SEARCHDOCS_EMBEDDING_DIMS", default_value_t = 384, global = true)]
    embedding_dims: usize,

    /// OpenAI-compatible chat completion service used by `ask`.
    #[arg(long, env = "SEARCHDOCS_GENERATOR_URL", global = true)]
    generator_url: Option<String>,

    #[arg(long, env = "SEARCHDOCS_GENERATOR_MODEL", default_value = "qwen2-0.5b-instruct", global = true)]
    generator_model: String,

    #[arg(long, env = "SEARCHDOCS_API_KEY", hide_env_values = true, global = true)]
    api_key: Option<String>,

    /// Verify TLS certificates of the backing services.
    #[arg(short = 's', long = "tlsverify", value_enum, default_value = "n", global = true)]
    tls_verify: YesNo,

    /// Request timeout in seconds.
    #[arg(long, default_value_t = 5, global = true)]
    timeout_secs: u64,

    /// Connect timeout in seconds.
    #[arg(long, default_value_t = 1, global = true)]
    connect_timeout_secs: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Index a file or every supported file below a folder.
    Ingest {
        /// File or folder to ingest.
        path: PathBuf,

        /// Only ingest files modified after this local time ("YYYY-MM-DD HH:MM:SS").
        #[arg(short = 'r', long = "prevrun-dt")]
        prevrun_dt: Option<String>,

        /// Replace documents whose content is already indexed.
        #[arg(short = 'o', long = "overwrite-on-dup", value_enum, default_value = "n")]
        overwrite_on_dup: YesNo,

        /// Write the full-text index.
        #[arg(short = 't', long = "fulltext", value_enum, default_value = "y")]
        fulltext: YesNo,

        /// Write chunk embeddings.
        #[arg(short = 'e', long = "embeddings", value_enum, default_value = "y")]
        embeddings: YesNo,

        /// Use the last successful run as the cutoff when --prevrun-dt is absent.
        #[arg(long, default_value_t = false)]
        incremental: bool,

        /// Where the last successful run time is kept.
        #[arg(long, env = "SEARCHDOCS_RUN_RECORD", default_value = ".searchdocs/run_record.json")]
        run_record: PathBuf,

        #[arg(long, default_value_t = 4)]
        workers: usize,

        #[arg(long, default_value_t = 512)]
        max_tokens: usize,

        #[arg(long, default_value_t = 64)]
        overlap_tokens: usize,

        /// Hugging Face tokenizer.json of the embedding model; chunks are
        /// measured in its tokens. Required with --embedding-url unless
        /// --tokens picks an estimate.
        #[arg(long, env = "SEARCHDOCS_TOKENIZER", conflicts_with = "tokens")]
        tokenizer: Option<PathBuf>,

        /// Token estimate used without a tokenizer file [default: chars].
        #[arg(long, value_enum)]
        tokens: Option<TokenEstimate>,
    },
    /// Hybrid full-text and semantic search.
    Search {
        query: String,

        /// Number of documents to return.
        #[arg(short = 'k', long, default_value_t = 10)]
        top_k: usize,

        #[arg(long, default_value_t = 0.5)]
        lexical_weight: f64,

        #[arg(long, default_value_t = 0.5)]
        vector_weight: f64,

        /// Also summarize the hits with the generator.
        #[arg(long, value_enum, default_value = "never")]
        summarize: Summarize,
    },
    /// Search, then answer from the retrieved text.
    Ask {
        query: String,

        #[arg(short = 'k', long, default_value_t = 5)]
        top_k: usize,
    },
}

impl Cli {
    fn http(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            verify_tls: self.tls_verify.enabled(),
        }
    }

    fn embedder(&self, http: &HttpClientConfig) -> anyhow::Result<Arc<dyn Embedder>> {
        Ok(match &self.embedding_url {
            Some(url) => Arc::new(HttpEmbedder::new(
                url,
                &self.embedding_model,
                self.embedding_dims,
                self.api_key.clone(),
                http,
            )?),
            None => Arc::new(CharacterNgramEmbedder::new(self.embedding_dims)),
        })
    }

    fn token_counter(
        &self,
        tokenizer: Option<&PathBuf>,
        tokens: Option<TokenEstimate>,
    ) -> anyhow::Result<Arc<dyn TokenCounter>> {
        Ok(match (tokenizer, tokens) {
            (Some(path), _) => {
                let counter = ModelTokenCounter::from_file(path)?;
                info!(
                    tokenizer = %path.display(),
                    reserved = counter.reserved(),
                    "chunking with model tokenizer"
                );
                Arc::new(counter)
            }
            (None, Some(TokenEstimate::Words)) => Arc::new(WhitespaceTokenCounter),
            (None, Some(TokenEstimate::Chars)) => Arc::new(CharRatioTokenCounter::default()),
            (None, None) if self.embedding_url.is_some() => bail!(
                "--tokenizer (or SEARCHDOCS_TOKENIZER) is required with --embedding-url; \
                 pass --tokens to chunk by an estimate instead"
            ),
            (None, None) => Arc::new(CharRatioTokenCounter::default()),
        })
    }

    fn retriever(&self, http: &HttpClientConfig, config: RetrievalConfig) -> anyhow::Result<HybridRetriever> {
        let term_index = OpenSearchTermIndex::new(&self.opensearch_url, &self.opensearch_index, http)?;
        let vector_store = QdrantVectorStore::new(&self.qdrant_url, &self.qdrant_collection, http)?;
        Ok(HybridRetriever::new(Arc::new(term_index), Arc::new(vector_store), self.embedder(http)?)
            .with_config(config))
    }

    fn rag(&self, http: &HttpClientConfig, retriever: HybridRetriever) -> anyhow::Result<RagPipeline> {
        let Some(url) = &self.generator_url else {
            bail!("--generator-url (or SEARCHDOCS_GENERATOR_URL) is required to generate answers");
        };
        let config = RagConfig::default();
        let generator = HttpGenerator::new(url, &self.generator_model, self.api_key.clone(), &config, http)?;
        Ok(RagPipeline::new(retriever, Arc::new(generator), config))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let http = cli.http();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "searchdocs boot"
    );

    match &cli.command {
        Command::Ingest {
            path,
            prevrun_dt,
            overwrite_on_dup,
            fulltext,
            embeddings,
            incremental,
            run_record,
            workers,
            max_tokens,
            overlap_tokens,
            tokenizer,
            tokens,
        } => {
            let store = RunRecordStore::new(run_record);
            let modified_after = match prevrun_dt {
                Some(value) => Some(parse_prevrun_dt(value)?),
                None if *incremental => store.load().await?.last_successful_run,
                None => None,
            };

            let options = IngestionOptions {
                overwrite_on_duplicate: overwrite_on_dup.enabled(),
                full_text: fulltext.enabled(),
                embeddings: embeddings.enabled(),
                modified_after,
                workers: *workers,
                chunking: ChunkingConfig {
                    max_tokens: *max_tokens,
                    overlap_tokens: *overlap_tokens,
                },
            };
            let token_counter = cli.token_counter(tokenizer.as_ref(), *tokens)?;

            let term_index = OpenSearchTermIndex::new(&cli.opensearch_url, &cli.opensearch_index, &http)?;
            let vector_store = QdrantVectorStore::new(&cli.qdrant_url, &cli.qdrant_collection, &http)?;
            let cancellation = CancellationFlag::new();
            let controller = IndexController::new(
                Arc::new(term_index),
                Arc::new(vector_store),
                cli.embedder(&http)?,
            )?
            .with_token_counter(token_counter)
            .with_cancellation(cancellation.clone());

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight documents");
                    cancellation.cancel();
                }
            });

            let summary = controller
                .run(path, &options, Some(&store))
                .await
                .with_context(|| format!("ingestion of {} failed", path.display()))?;

            println!("{summary}");
            if summary.cancelled {
                bail!("ingestion cancelled");
            }
        }
        Command::Search {
            query,
            top_k,
            lexical_weight,
            vector_weight,
            summarize,
        } => {
            let config = RetrievalConfig {
                weights: FusionWeights {
                    lexical: *lexical_weight,
                    vector: *vector_weight,
                },
                ..RetrievalConfig::default()
            };
            let retriever = cli.retriever(&http, config)?;

            let wants_summary = match summarize {
                Summarize::Never => false,
                Summarize::Auto => is_question(query),
                Summarize::Always => true,
            };
            if wants_summary {
                let answer = cli.rag(&http, retriever)?.answer(query, *top_k).await?;
                print_answer(&answer);
            } else {
                let result = retriever.search(&SearchQuery::new(query.as_str(), *top_k)).await?;
                print_hits(&result);
            }
        }
        Command::Ask { query, top_k } => {
            let retriever = cli.retriever(&http, RetrievalConfig::default())?;
            let answer = cli.rag(&http, retriever)?.answer(query, *top_k).await?;
            print_answer(&answer);
        }
    }

    Ok(())
}

fn print_hits(result: &RetrievalResult) {
    println!("query: {}", result.query);
    if let Some(side) = result.degraded {
        println!("warning: {side} search unavailable, results ranked by one source");
    }
    if result.hits.is_empty() {
        println!("No document found");
        return;
    }

    for (rank, hit) in result.hits.iter().enumerate() {
        let modes: Vec<String> = hit.modes.iter().map(ToString::to_string).collect();
        println!(
            "{:>2}. score={:.4} lexical={:.4} vector={:.4} [{}] {}",
            rank + 1,
            hit.fused_score,
            hit.lexical_score,
            hit.vector_score,
            modes.join("+"),
            hit.source_path
        );
        if let Some(title) = &hit.title {
            println!("    title: {title}");
        }
        if !hit.snippet.is_empty() {
            println!("    {}", hit.snippet);
        }
    }
}

fn print_answer(answer: &RagAnswer) {
    print_hits(&answer.retrieval);
    match (&answer.answer, &answer.generation_error) {
        (Some(text), _) => println!("\nanswer:\n{text}"),
        (None, Some(error)) => println!("\nanswer unavailable: {error}"),
        (None, None) => {}
    }
}
