use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use log::{error, info};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use hash_rag::context::GroundedPrompt;
use hash_rag::document::Document;
use hash_rag::gemini::{GeminiClient, GeminiConfig, Generator};
use hash_rag::rag::{RagConfig, RetrievalService, RetrievedChunk};

/// Local retrieval over ingested documents using hashed embeddings
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract a document (text or PDF) and add it to the corpus
    Ingest {
        #[arg(index = 1)]
        file_path: String,
    },
    /// Print the passages most relevant to a query
    Search {
        query: String,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Answer a question from retrieved passages
    Ask {
        question: String,
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Interactive question loop
    Chat {
        #[arg(short = 'k', long)]
        top_k: Option<usize>,
    },
    /// Show chunk and embedding counts
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let config = RagConfig::from_env().context("Invalid retrieval configuration")?;

    let service = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || RetrievalService::open(&config))
            .await?
            .context("Failed to open the corpus")?
    };
    let service = Arc::new(service);

    match args.command {
        Command::Ingest { file_path } => ingest(service, file_path).await,
        Command::Search { query, top_k } => {
            let hits = retrieve(&service, &query, top_k.unwrap_or(config.top_k)).await?;
            if hits.is_empty() {
                println!("No relevant information found.");
            }
            for (rank, hit) in hits.iter().enumerate() {
                println!(
                    "#{} {} [chunk {}] score {:.3}\n{}\n",
                    rank + 1,
                    hit.chunk.source_file,
                    hit.chunk.chunk_index,
                    hit.score,
                    hit.chunk.content
                );
            }
            Ok(())
        }
        Command::Ask { question, top_k } => {
            let generator = generator_from_env();
            let top_k = top_k.unwrap_or(config.top_k);
            let text = answer(&service, generator.as_ref(), &question, top_k).await?;
            println!("{}", text);
            Ok(())
        }
        Command::Chat { top_k } => {
            run_query_loop(&service, top_k.unwrap_or(config.top_k))
                .await
                .context("Error in query loop")
        }
        Command::Stats => {
            let stats = tokio::task::spawn_blocking(move || service.stats()).await??;
            println!("chunks: {}\nembeddings: {}", stats.chunks, stats.embeddings);
            Ok(())
        }
    }
}

async fn ingest(service: Arc<RetrievalService>, file_path: String) -> Result<()> {
    info!("Processing file: {}", file_path);

    if !Path::new(&file_path).exists() {
        error!("File not found: {}", file_path);
        return Err(anyhow::anyhow!("File not found"));
    }

    let report = tokio::task::spawn_blocking(move || -> Result<_> {
        let document = Document::from_file(&file_path).context("Failed to process document")?;
        info!("Document type: {}", document.mime_type);
        service
            .ingest(&document.content, &document.source_file)
            .context("Failed to ingest document")
    })
    .await??;

    println!(
        "Ingested {} chunks from {}",
        report.chunk_count(),
        report.source_file
    );
    Ok(())
}

async fn retrieve(
    service: &Arc<RetrievalService>,
    query: &str,
    top_k: usize,
) -> Result<Vec<RetrievedChunk>> {
    let service = Arc::clone(service);
    let query = query.to_string();
    let hits = tokio::task::spawn_blocking(move || service.search_chunks(&query, top_k)).await??;
    Ok(hits)
}

fn generator_from_env() -> Option<GeminiClient> {
    match GeminiConfig::from_env() {
        Ok(config) => Some(GeminiClient::new(config)),
        Err(e) => {
            info!("Generation disabled: {}", e);
            None
        }
    }
}

/// Retrieve passages for a question and, when a generator is configured,
/// ask it to answer from them
async fn answer(
    service: &Arc<RetrievalService>,
    generator: Option<&GeminiClient>,
    question: &str,
    top_k: usize,
) -> Result<String> {
    let hits = retrieve(service, question, top_k).await?;
    let passages: Vec<&str> = hits.iter().map(|hit| hit.chunk.content.as_str()).collect();
    let prompt = GroundedPrompt::build(question, &passages);

    match generator {
        Some(generator) => generator
            .generate(&prompt.system_prompt, &prompt.user_message)
            .await
            .context("Failed to generate answer"),
        None => Ok(format!(
            "(generation disabled, set GEMINI_API_KEY)\n\n{}",
            prompt.user_message
        )),
    }
}

/// Run the interactive question loop
async fn run_query_loop(service: &Arc<RetrievalService>, top_k: usize) -> Result<()> {
    let generator = generator_from_env();
    println!("Ready to answer questions. Type 'exit' to quit.");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut buffer = String::new();

    loop {
        print!("\nYour question: ");
        stdout.flush()?;

        buffer.clear();
        if stdin.read_line(&mut buffer)? == 0 {
            break;
        }

        let question = buffer.trim();
        if question.is_empty() {
            continue;
        }
        if question.eq_ignore_ascii_case("exit") {
            println!("Goodbye!");
            break;
        }

        match answer(service, generator.as_ref(), question, top_k).await {
            Ok(text) => println!("\n{}", text),
            Err(e) => error!("{:#}", e),
        }
    }

    Ok(())
}
