//! Fair-share Stage B context combiner.
//!
//! Merges Stage A sections into one context string under a total token budget
//! while guaranteeing each contributing analyzer a minimum allocation. When
//! everything fits, sections pass through untouched; otherwise the budget is
//! split into a per-section floor plus a proportional share of the remainder
//! weighted by each section's excess size.

use crate::clients::TokenCounter;

/// Instrumentation emitted alongside the combined context.
#[derive(Debug, Clone)]
pub(crate) struct FairShareReport {
    pub(crate) per_section_tokens: Vec<(String, usize)>,
    pub(crate) allocations: Vec<(String, usize)>,
    pub(crate) after_tokens: Vec<(String, usize)>,
    pub(crate) final_tokens: usize,
    pub(crate) min_per_analyzer: usize,
    pub(crate) budget: usize,
}

/// Combine `(slug, section)` pairs under `total_budget_tokens`, guaranteeing
/// at least `min(min_per_analyzer, budget / n)` tokens per section. Output
/// order equals input order. A budget of 0 disables trimming.
pub(crate) fn build_fair_combined_context(
    sections: &[(String, String)],
    counter: &TokenCounter,
    total_budget_tokens: usize,
    min_per_analyzer: usize,
) -> (String, FairShareReport) {
    let per_counts: Vec<(String, usize)> = sections
        .iter()
        .map(|(slug, text)| (slug.clone(), counter.count(text)))
        .collect();
    let total_tokens: usize = per_counts.iter().map(|(_, c)| *c).sum();

    // No budget or everything fits: concatenate as-is.
    if total_budget_tokens == 0 || total_tokens <= total_budget_tokens {
        let combined = concatenate(sections.iter().map(|(_, text)| text.as_str()));
        let final_tokens = counter.count(&combined);
        let report = FairShareReport {
            allocations: per_counts.clone(),
            after_tokens: per_counts.clone(),
            per_section_tokens: per_counts,
            final_tokens,
            min_per_analyzer,
            budget: total_budget_tokens,
        };
        return (combined, report);
    }

    let n = sections.len().max(1);
    let mut min_per = min_per_analyzer.max(1);
    if min_per * n > total_budget_tokens {
        min_per = (total_budget_tokens / n).max(1);
    }
    let remaining = total_budget_tokens.saturating_sub(min_per * n);

    // Weights based on excess beyond the floor; +1 keeps sections that
    // already fit under the floor in the proportional share.
    let weights: Vec<f64> = per_counts
        .iter()
        .map(|(_, count)| (count.saturating_sub(min_per)) as f64 + 1.0)
        .collect();
    let weight_sum: f64 = weights.iter().sum();

    let mut allocations: Vec<(String, usize)> = per_counts
        .iter()
        .zip(weights.iter())
        .map(|((slug, _), weight)| {
            let mut alloc = min_per;
            if remaining > 0 && weight_sum > 0.0 {
                alloc += ((remaining as f64) * (weight / weight_sum)).round() as usize;
            }
            (slug.clone(), alloc.max(1))
        })
        .collect();

    // Fix rounding so the allocation sum equals the budget exactly.
    let allocated: usize = allocations.iter().map(|(_, a)| *a).sum();
    if allocated != total_budget_tokens {
        if let Some(last) = allocations.last_mut() {
            let adjusted =
                (last.1 as i64) + (total_budget_tokens as i64) - (allocated as i64);
            last.1 = adjusted.max(1) as usize;
        }
    }

    let mut after_tokens = Vec::with_capacity(sections.len());
    let mut trimmed_sections = Vec::with_capacity(sections.len());
    for ((_, text), (slug, alloc)) in sections.iter().zip(allocations.iter()) {
        let trimmed = counter.trim_to_tokens(text, *alloc);
        after_tokens.push((slug.clone(), counter.count(&trimmed)));
        trimmed_sections.push(trimmed);
    }

    let combined = concatenate(trimmed_sections.iter().map(String::as_str));
    let final_tokens = counter.count(&combined);

    let report = FairShareReport {
        per_section_tokens: per_counts,
        allocations,
        after_tokens,
        final_tokens,
        min_per_analyzer: min_per,
        budget: total_budget_tokens,
    };
    (combined, report)
}

fn concatenate<'a>(sections: impl Iterator<Item = &'a str>) -> String {
    let mut parts = Vec::new();
    for text in sections {
        parts.push(text.to_string());
        parts.push("\n---\n".to_string());
    }
    parts.join("\n")
}
