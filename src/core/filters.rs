//! Composable passes over feature lists. Every filter is total and
//! deterministic given its parameters, and never fabricates features:
//! its output is a subset of its input.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;

use crate::core::budget::Budgeter;
use crate::core::features::{parse_intervals, CodeFeature, Interval};
use crate::llm::{ChatMessage, LlmClient, ProviderError};

/// Token budget the selector model can hold, minus prompt overheads.
const SELECTOR_CONTEXT_TOKENS: usize = 16_000;
const SELECTOR_RESPONSE_BUFFER: usize = 500;

const FEATURE_SELECTOR_PROMPT: &str = "\
You select code sections relevant to a user query. You are given a query \
and a list of code files with sections labeled by path and line ranges. \
Respond with a JSON list of strings naming the relevant sections, e.g. \
[\"src/lib.rs:10-42\", \"src/main.rs\"]. Respond with JSON only.";

/// Selector failures that callers may recover from.
#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    /// The model response was not a parseable reference list
    #[error("unparseable selector output: {0}")]
    Parse(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Embedding vectors cached by content hash, so repeated ranking runs
/// only pay for unseen text.
#[derive(Default)]
pub struct EmbeddingCache {
    map: Mutex<HashMap<u64, Vec<f32>>>,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch embeddings for `texts`, batching cache misses into a single
    /// provider call.
    pub async fn get_many(
        &self,
        llm: &LlmClient,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let keys: Vec<u64> = texts
            .iter()
            .map(|t| xxhash_rust::xxh64::xxh64(t.as_bytes(), 0))
            .collect();

        let misses: Vec<(usize, String)> = {
            let map = self.map.lock().unwrap();
            texts
                .iter()
                .enumerate()
                .filter(|(i, _)| !map.contains_key(&keys[*i]))
                .map(|(i, t)| (i, t.clone()))
                .collect()
        };

        if !misses.is_empty() {
            let miss_texts: Vec<String> = misses.iter().map(|(_, t)| t.clone()).collect();
            let vectors = llm.embed(&miss_texts).await?;
            let mut map = self.map.lock().unwrap();
            for ((i, _), v) in misses.iter().zip(vectors) {
                map.insert(keys[*i], v);
            }
        }

        let map = self.map.lock().unwrap();
        Ok(keys.iter().map(|k| map[k].clone()).collect())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Shared dependencies for filter passes.
pub struct FilterContext<'a> {
    pub root: &'a Path,
    pub budgeter: &'a Budgeter,
    pub llm: &'a LlmClient,
    pub embeddings: &'a EmbeddingCache,
}

/// The closed set of filter passes, dispatched by name.
pub enum FeatureFilter {
    /// Greedy keep-in-order under a token budget
    Truncate {
        max_tokens: usize,
        respect_user_include: bool,
    },

    /// Rank by cosine similarity between prompt and rendered feature
    EmbeddingSimilarity { prompt: String },

    /// Ask a model which features matter, then truncate
    LlmSelector {
        prompt: String,
        max_tokens: usize,
        expected_edits: Option<Vec<String>>,
    },

    /// The auto-mode composition
    Default {
        max_tokens: usize,
        use_llm: bool,
        use_embeddings: bool,
        prompt: String,
        expected_edits: Option<Vec<String>>,
    },
}

impl FeatureFilter {
    pub fn name(&self) -> &'static str {
        match self {
            FeatureFilter::Truncate { .. } => "truncate",
            FeatureFilter::EmbeddingSimilarity { .. } => "embedding-similarity",
            FeatureFilter::LlmSelector { .. } => "llm-selector",
            FeatureFilter::Default { .. } => "default",
        }
    }

    /// Run the pass. Output features are drawn from the input list with
    /// metadata intact.
    pub async fn apply(
        &self,
        ctx: &FilterContext<'_>,
        features: Vec<CodeFeature>,
    ) -> Result<Vec<CodeFeature>> {
        match self {
            FeatureFilter::Truncate {
                max_tokens,
                respect_user_include,
            } => Ok(truncate(ctx, features, *max_tokens, *respect_user_include)?),

            FeatureFilter::EmbeddingSimilarity { prompt } => {
                Ok(rank_by_similarity(ctx, features, prompt).await?)
            }

            FeatureFilter::LlmSelector {
                prompt,
                max_tokens,
                expected_edits,
            } => Ok(select_with_llm(ctx, features, prompt, *max_tokens, expected_edits.as_deref())
                .await
                .map_err(anyhow::Error::from)?),

            FeatureFilter::Default {
                max_tokens,
                use_llm,
                use_embeddings,
                prompt,
                expected_edits,
            } => {
                default_pipeline(
                    ctx,
                    features,
                    *max_tokens,
                    *use_llm,
                    *use_embeddings,
                    prompt,
                    expected_edits.as_deref(),
                )
                .await
            }
        }
    }
}

/// Greedily keep features in input order, dropping any whose addition
/// would exceed the budget. With `respect_user_include`, user-pinned
/// features are kept unconditionally and the remaining budget shrinks
/// accordingly.
fn truncate(
    ctx: &FilterContext<'_>,
    features: Vec<CodeFeature>,
    max_tokens: usize,
    respect_user_include: bool,
) -> Result<Vec<CodeFeature>> {
    let mut remaining = max_tokens as isize;
    let mut out = Vec::new();

    if respect_user_include {
        for feature in &features {
            if feature.user_included {
                remaining -= feature.count_tokens(ctx.root, ctx.budgeter)? as isize;
            }
        }
    }

    for feature in features {
        if respect_user_include && feature.user_included {
            out.push(feature);
            continue;
        }
        let tokens = feature.count_tokens(ctx.root, ctx.budgeter)? as isize;
        if tokens <= remaining {
            remaining -= tokens;
            out.push(feature);
        }
    }

    Ok(out)
}

/// Sort features descending by cosine similarity between the prompt
/// embedding and each rendered feature's embedding. Ties break on the
/// reference string so runs are reproducible.
async fn rank_by_similarity(
    ctx: &FilterContext<'_>,
    features: Vec<CodeFeature>,
    prompt: &str,
) -> Result<Vec<CodeFeature>> {
    if features.is_empty() || prompt.is_empty() {
        return Ok(features);
    }

    let mut texts = vec![prompt.to_string()];
    for feature in &features {
        texts.push(feature.render(ctx.root)?);
    }

    let vectors = ctx.embeddings.get_many(ctx.llm, &texts).await?;
    let prompt_vec = &vectors[0];

    let mut scored: Vec<(f32, CodeFeature)> = features
        .into_iter()
        .zip(vectors[1..].iter())
        .map(|(f, v)| (cosine_similarity(prompt_vec, v), f))
        .collect();

    scored.sort_by(|(sa, fa), (sb, fb)| {
        sb.total_cmp(sa)
            .then_with(|| fa.ref_string(ctx.root).cmp(&fb.ref_string(ctx.root)))
    });

    Ok(scored.into_iter().map(|(_, f)| f).collect())
}

/// Ask the selector model for the relevant subset: greedily pre-select to
/// fit its context, send a classification prompt, match the returned
/// references back to input features, then truncate to the budget.
async fn select_with_llm(
    ctx: &FilterContext<'_>,
    features: Vec<CodeFeature>,
    prompt: &str,
    max_tokens: usize,
    expected_edits: Option<&[String]>,
) -> Result<Vec<CodeFeature>, SelectorError> {
    let preselect_budget = SELECTOR_CONTEXT_TOKENS
        .saturating_sub(ctx.budgeter.count(FEATURE_SELECTOR_PROMPT))
        .saturating_sub(ctx.budgeter.count(prompt))
        .saturating_sub(SELECTOR_RESPONSE_BUFFER);
    let preselected = truncate(ctx, features.clone(), preselect_budget, false)
        .map_err(SelectorError::Other)?;

    let mut content = format!("User Query:\n{prompt}\n\nCode Files:\n");
    for feature in &preselected {
        content.push_str(&feature.render(ctx.root).map_err(SelectorError::Other)?);
        content.push('\n');
    }
    if let Some(edits) = expected_edits {
        content.push_str("\nExpected edits:\n");
        for edit in edits {
            content.push_str(edit);
            content.push('\n');
        }
    }

    let messages = vec![
        ChatMessage::system(FEATURE_SELECTOR_PROMPT),
        ChatMessage::system(content),
    ];
    let response = ctx.llm.chat(&messages).await?;

    let refs: Vec<String> = serde_json::from_str(response.trim())
        .map_err(|_| SelectorError::Parse(response.clone()))?;

    // Match references back to inputs, preserving metadata
    let mut selected = Vec::new();
    for reference in refs {
        let (path_part, ranges) = match reference.split_once(':') {
            Some((p, r)) => (p, parse_intervals(r)),
            None => (reference.as_str(), None),
        };
        let path: PathBuf = ctx.root.join(path_part);
        let ranges = ranges.unwrap_or_else(|| vec![Interval::whole()]);
        let probe = CodeFeature::with_intervals(path, ranges);

        let matching: Vec<&CodeFeature> = features
            .iter()
            .filter(|f| f.intersects(&probe))
            .collect();
        if matching.is_empty() {
            return Err(SelectorError::Parse(format!(
                "no input feature matches selected reference {reference}"
            )));
        }
        for m in matching {
            if !selected.contains(m) {
                selected.push(m.clone());
            }
        }
    }

    // Final greedy pass enforces the real budget
    truncate(ctx, selected, max_tokens, false).map_err(SelectorError::Other)
}

/// The auto-mode composition: user-included features ride along
/// unconditionally; the remainder goes through the LLM selector (when
/// enabled, with a clean fallback on parse failure), else the embedding
/// ranker, and finally greedy truncation holds the budget.
async fn default_pipeline(
    ctx: &FilterContext<'_>,
    features: Vec<CodeFeature>,
    max_tokens: usize,
    use_llm: bool,
    use_embeddings: bool,
    prompt: &str,
    expected_edits: Option<&[String]>,
) -> Result<Vec<CodeFeature>> {
    let (user, rest): (Vec<CodeFeature>, Vec<CodeFeature>) =
        features.into_iter().partition(|f| f.user_included);

    let rest = if use_llm {
        match select_with_llm(ctx, rest.clone(), prompt, max_tokens, expected_edits).await {
            Ok(selected) => selected,
            Err(SelectorError::Parse(output)) => {
                tracing::warn!(output, "feature selector output unparseable; falling back");
                maybe_rank(ctx, rest, use_embeddings, prompt).await?
            }
            Err(SelectorError::Provider(e)) => return Err(e.into()),
            Err(SelectorError::Other(e)) => return Err(e),
        }
    } else {
        maybe_rank(ctx, rest, use_embeddings, prompt).await?
    };

    let mut remaining = max_tokens as isize;
    for feature in &user {
        remaining -= feature.count_tokens(ctx.root, ctx.budgeter)? as isize;
    }
    let fitted_rest = greedy_with_levels(ctx, rest, remaining)?;

    let mut combined = user;
    combined.extend(fitted_rest);
    Ok(combined)
}

/// Greedy fit with level fallback: keep each feature at its own level
/// when it fits; otherwise degrade the whole file to an outline or bare
/// file name. A feature is never split to fit.
fn greedy_with_levels(
    ctx: &FilterContext<'_>,
    features: Vec<CodeFeature>,
    mut remaining: isize,
) -> Result<Vec<CodeFeature>> {
    use crate::core::features::CodeMessageLevel;
    use std::collections::HashSet;

    let mut out = Vec::new();
    // Files already represented by a degraded whole-file feature
    let mut degraded: HashSet<std::path::PathBuf> = HashSet::new();

    for feature in features {
        if degraded.contains(&feature.path) {
            continue;
        }
        let tokens = feature.count_tokens(ctx.root, ctx.budgeter)? as isize;
        if tokens <= remaining {
            remaining -= tokens;
            out.push(feature);
            continue;
        }

        for level in [CodeMessageLevel::Cmap, CodeMessageLevel::FileName] {
            let mut fallback = CodeFeature::new(feature.path.clone(), level);
            fallback.diff = feature.diff.clone();
            fallback.user_included = feature.user_included;
            let tokens = fallback.count_tokens(ctx.root, ctx.budgeter)? as isize;
            if tokens <= remaining {
                remaining -= tokens;
                out.push(fallback);
                degraded.insert(feature.path.clone());
                break;
            }
        }
    }

    Ok(out)
}

async fn maybe_rank(
    ctx: &FilterContext<'_>,
    features: Vec<CodeFeature>,
    use_embeddings: bool,
    prompt: &str,
) -> Result<Vec<CodeFeature>> {
    if use_embeddings && !prompt.is_empty() {
        rank_by_similarity(ctx, features, prompt).await
    } else {
        Ok(features)
    }
}
