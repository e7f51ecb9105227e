#![cfg(test)]

use crate::analyzer::{Analyzer, EnglishAnalyzer};
use crate::bins::{build_unigram_bins, test::TableIndex, BinConfig};
use crate::pir_internals::prf::hash_token_choice;
use crate::router::{write_results_json, QueryRouter, RouterConfig};
use std::collections::HashMap;

const WORDS: [&str; 20] = [
    "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india", "juliett", "kilo", "lima", "mike", "november",
    "oscar", "papa", "quebec", "romeo", "sierra", "tango",
];

const NUM_DOCS: usize = 40;
const DIM: usize = 8;
const MAX_BINS: u64 = 16;

fn toy_embeddings() -> Vec<Vec<f32>> {
    // Rows are pairwise distinct and never all-zero.
    (0..NUM_DOCS)
        .map(|doc| (0..DIM).map(|col| ((doc * DIM + col) % 97 + 1) as f32 * 0.25).collect())
        .collect()
}

fn toy_index(analyzer: &EnglishAnalyzer) -> (TableIndex, Vec<String>) {
    let mut postings = HashMap::new();
    let mut vocab = Vec::new();

    for (i, word) in WORDS.iter().enumerate() {
        let term = analyzer.analyze(word)[0].term.clone();

        let hits: Vec<(String, f32)> = (0..3 + i % 3)
            .map(|rank| {
                let doc = (2 * i + 5 * rank + 7) % NUM_DOCS;
                (doc.to_string(), 10.0 - rank as f32)
            })
            .collect();

        postings.insert(term.clone(), hits);
        vocab.push(term);
    }

    let index = TableIndex {
        postings,
        docs: (0..NUM_DOCS).map(|i| i.to_string()).collect(),
    };
    (index, vocab)
}

fn expected_doc_ids(bins: &[Vec<String>], terms: &[String], choices: u32) -> Vec<String> {
    let mut out = Vec::new();
    for term in terms {
        for choice in 0..choices {
            let bin = (hash_token_choice(term, choice) % MAX_BINS) as usize;
            out.extend(bins[bin].iter().cloned());
        }
    }
    out
}

#[test]
fn retrieval_matches_the_bin_assignment_end_to_end() {
    let analyzer = EnglishAnalyzer::new();
    let (index, vocab) = toy_index(&analyzer);

    let bin_config = BinConfig {
        top_k: 5,
        choices: 1,
        max_bins: MAX_BINS,
        threshold: 1,
    };
    let bins = build_unigram_bins(&index, &vocab, &bin_config);
    assert_eq!(bins.len(), MAX_BINS as usize);
    assert!(bins.iter().any(|bin| !bin.is_empty()));

    let embeddings = toy_embeddings();
    let router_config = RouterConfig {
        dim: DIM,
        choices: 1,
        batch_size: 8,
        failure_prob_log2: 8,
    };
    let mut router =
        QueryRouter::with_analyzer_seeded(EnglishAnalyzer::new(), &bins, &embeddings, router_config, [21u8; 32]).unwrap();

    // Two-word queries: at most two bins per batch, so nothing is dropped.
    for pair in WORDS.chunks(2) {
        let text = pair.join(" ");
        let terms: Vec<String> = EnglishAnalyzer::new().analyze(&text).into_iter().map(|t| t.term).collect();

        let got = router.search(&text).unwrap();
        let want = expected_doc_ids(&bins, &terms, 1);
        assert_eq!(got, want, "query '{}'", text);
    }
}

#[test]
fn multi_choice_queries_probe_every_placement() {
    let analyzer = EnglishAnalyzer::new();
    let (index, vocab) = toy_index(&analyzer);

    let bin_config = BinConfig {
        top_k: 5,
        choices: 2,
        max_bins: MAX_BINS,
        threshold: 1,
    };
    let bins = build_unigram_bins(&index, &vocab, &bin_config);

    let embeddings = toy_embeddings();
    let router_config = RouterConfig {
        dim: DIM,
        choices: 2,
        batch_size: 8,
        failure_prob_log2: 8,
    };
    let mut router =
        QueryRouter::with_analyzer_seeded(EnglishAnalyzer::new(), &bins, &embeddings, router_config, [22u8; 32]).unwrap();

    // Single-word queries: two indices per batch, within every budget.
    for word in WORDS.iter().take(8) {
        let terms: Vec<String> = EnglishAnalyzer::new().analyze(word).into_iter().map(|t| t.term).collect();

        let got = router.search(word).unwrap();
        let want = expected_doc_ids(&bins, &terms, 2);
        assert_eq!(got, want, "query '{}'", word);
    }
}

#[test]
fn a_query_stream_produces_a_stable_results_file() {
    let analyzer = EnglishAnalyzer::new();
    let (index, vocab) = toy_index(&analyzer);

    let bin_config = BinConfig {
        top_k: 5,
        choices: 1,
        max_bins: MAX_BINS,
        threshold: 1,
    };
    let bins = build_unigram_bins(&index, &vocab, &bin_config);

    let embeddings = toy_embeddings();
    let router_config = RouterConfig {
        dim: DIM,
        choices: 1,
        batch_size: 8,
        failure_prob_log2: 8,
    };
    let mut router =
        QueryRouter::with_analyzer_seeded(EnglishAnalyzer::new(), &bins, &embeddings, router_config, [23u8; 32]).unwrap();

    let queries: Vec<(String, String)> = WORDS
        .chunks(2)
        .enumerate()
        .map(|(i, pair)| (format!("q{}", i), pair.join(" ")))
        .collect();

    let results = router.search_all(&queries).unwrap();
    assert_eq!(results.len(), queries.len());

    for (query_id, text) in &queries {
        let terms: Vec<String> = EnglishAnalyzer::new().analyze(text).into_iter().map(|t| t.term).collect();
        assert_eq!(results[query_id], expected_doc_ids(&bins, &terms, 1), "query '{}'", text);
    }

    let path = std::env::temp_dir().join(format!("piano-pir-e2e-{}.json", std::process::id()));
    write_results_json(&path, &results).unwrap();
    let raw = std::fs::read_to_string(&path).unwrap();
    std::fs::remove_file(&path).ok();

    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    for (query_id, doc_ids) in &results {
        let got: Vec<String> = parsed[query_id]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(&got, doc_ids);
    }
}
