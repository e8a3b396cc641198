//! Image fan-out across styles.
//!
//! A batch is planned (validated, deduplicated, size-checked) before any call
//! goes out, then every style unit runs as its own task. One unit failing,
//! or even panicking, never cancels its siblings; the batch waits for all of
//! them and reports what succeeded alongside what did not.

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::{ExecutionMode, GenerationConfig};
use crate::error::{FanoutError, GenerationError};
use crate::gemini::GenerationGateway;
use crate::models::{GeneratedImage, StyleError, StyleGenerationRequest};
use crate::{prompts, styles};

/// Coerce a user-supplied count into `[1, max]`. Numbers are floored; numeric
/// strings are accepted; anything else becomes 1.
pub fn normalize_count(raw: &Value, max: u32) -> u32 {
    let n = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let n = match n {
        Some(n) if n.is_finite() => n.floor(),
        _ => return 1,
    };
    if n < 1.0 {
        1
    } else if n > max as f64 {
        max
    } else {
        n as u32
    }
}

/// Validated batch, ready to dispatch.
#[derive(Debug, Clone)]
pub struct FanoutPlan {
    pub units: Vec<StyleGenerationRequest>,
}

impl FanoutPlan {
    pub fn total_images(&self) -> u32 {
        self.units.iter().map(|u| u.count).sum()
    }
}

/// Build the per-style units. Duplicate and unknown style ids are dropped silently
/// (first occurrence wins); an empty result or a batch above the ceiling is refused.
pub fn plan(
    style_ids: &[String],
    count: u32,
    russian_text: &str,
    visual_instructions: &str,
    limits: &GenerationConfig,
) -> Result<FanoutPlan, FanoutError> {
    let count = count.clamp(1, limits.max_count_per_style);

    let mut seen = HashSet::new();
    let units: Vec<StyleGenerationRequest> = style_ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .filter_map(|id| styles::find_style(id))
        .map(|style| StyleGenerationRequest {
            style: style.id.to_string(),
            prompt_modifier: style.prompt_modifier.to_string(),
            count,
            russian_text: russian_text.to_string(),
            visual_instructions: visual_instructions.to_string(),
        })
        .collect();

    if units.is_empty() {
        return Err(FanoutError::NoValidStyles);
    }

    let requested = count * units.len() as u32;
    if requested > limits.max_total_images {
        return Err(FanoutError::TooManyImages {
            requested,
            max: limits.max_total_images,
        });
    }

    Ok(FanoutPlan { units })
}

/// Combined result of a settled batch.
#[derive(Debug, Default)]
pub struct FanoutOutcome {
    pub images: Vec<GeneratedImage>,
    pub style_errors: Vec<StyleError>,
}

impl FanoutOutcome {
    /// Partial success stays `Ok` with warnings; zero images is a batch failure.
    pub fn into_result(self) -> Result<FanoutOutcome, FanoutError> {
        if self.images.is_empty() {
            return Err(FanoutError::AllFailed {
                style_errors: self.style_errors,
            });
        }
        Ok(self)
    }
}

/// Dispatch every unit concurrently and wait for all of them to settle.
pub async fn run(
    gateway: Arc<dyn GenerationGateway>,
    plan: FanoutPlan,
    mode: ExecutionMode,
    max_concurrency: u32,
) -> FanoutOutcome {
    let limiter = match mode {
        ExecutionMode::Bounded => Some(Arc::new(Semaphore::new(max_concurrency.max(1) as usize))),
        _ => None,
    };

    info!(
        styles = plan.units.len(),
        images = plan.total_images(),
        ?mode,
        "image fan-out starting"
    );

    let handles: Vec<_> = plan
        .units
        .into_iter()
        .map(|unit| {
            let gateway = gateway.clone();
            let limiter = limiter.clone();
            let style = unit.style.clone();
            let handle = tokio::spawn(async move { run_unit(gateway.as_ref(), &unit, mode, limiter).await });
            (style, handle)
        })
        .collect();

    let settled = join_all(handles.into_iter().map(|(style, handle)| async move { (style, handle.await) })).await;

    let mut outcome = FanoutOutcome::default();
    for (style, joined) in settled {
        match joined {
            Ok(Ok(urls)) => {
                outcome
                    .images
                    .extend(urls.into_iter().map(|url| GeneratedImage { style: style.clone(), url }));
            }
            Ok(Err(e)) => {
                warn!(style = %style, error = %e, "style unit failed");
                outcome.style_errors.push(StyleError {
                    style,
                    message: e.to_string(),
                });
            }
            Err(join_err) => {
                error!(style = %style, error = %join_err, "style unit task aborted");
                outcome.style_errors.push(StyleError {
                    style,
                    message: "Unknown generation error".to_string(),
                });
            }
        }
    }

    if outcome.images.is_empty() {
        error!(failed = outcome.style_errors.len(), "image fan-out produced nothing");
    } else {
        info!(
            images = outcome.images.len(),
            failed_styles = outcome.style_errors.len(),
            "image fan-out complete"
        );
    }

    outcome
}

/// One style: `count` image calls. The unit fails only if every call fails.
async fn run_unit(
    gateway: &dyn GenerationGateway,
    unit: &StyleGenerationRequest,
    mode: ExecutionMode,
    limiter: Option<Arc<Semaphore>>,
) -> Result<Vec<String>, GenerationError> {
    let prompt = prompts::build_image_prompt(&unit.russian_text, &unit.prompt_modifier, &unit.visual_instructions);
    let prompt = prompt.as_str();

    let results: Vec<Result<String, GenerationError>> = match mode {
        ExecutionMode::Sequential => {
            let mut results = Vec::with_capacity(unit.count as usize);
            for _ in 0..unit.count {
                results.push(gateway.generate_image(prompt).await);
            }
            results
        }
        ExecutionMode::Parallel | ExecutionMode::Bounded => {
            let limiter = limiter.as_deref();
            join_all((0..unit.count).map(|_| async move {
                let _permit = match limiter {
                    Some(sem) => Some(
                        sem.acquire()
                            .await
                            .map_err(|_| GenerationError::EmptyOutput("generation limiter closed".to_string()))?,
                    ),
                    None => None,
                };
                gateway.generate_image(prompt).await
            }))
            .await
        }
    };

    let mut urls = Vec::new();
    let mut last_error = None;
    for result in results {
        match result {
            Ok(url) => urls.push(url),
            Err(e) => last_error = Some(e),
        }
    }

    if urls.is_empty() {
        if let Some(e) = &last_error {
            warn!(style = %unit.style, requested = unit.count, error = %e, "every image call failed");
        }
        return Err(GenerationError::EmptyOutput("Failed to generate any images".to_string()));
    }
    if let Some(e) = last_error {
        warn!(style = %unit.style, produced = urls.len(), requested = unit.count, error = %e, "style unit partially failed");
    }
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;

    fn limits() -> GenerationConfig {
        GenerationConfig::default()
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    /// Fails every image call whose prompt mentions one of `failing` modifiers;
    /// optionally fails only every other call for `flaky` styles.
    struct FakeImages {
        failing: Vec<&'static str>,
        flaky: Vec<&'static str>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeImages {
        fn new(failing: Vec<&'static str>) -> Self {
            Self {
                failing,
                flaky: Vec::new(),
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    fn modifier(id: &str) -> &'static str {
        styles::find_style(id).unwrap().prompt_modifier
    }

    #[async_trait]
    impl GenerationGateway for FakeImages {
        async fn generate_text(&self, _prompt: &str) -> Result<String, GenerationError> {
            unreachable!()
        }

        async fn generate_image(&self, prompt: &str) -> Result<String, GenerationError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.failing.iter().any(|id| prompt.ends_with(modifier(id))) {
                return Err(GenerationError::EmptyOutput("No image generated in the response".to_string()));
            }
            if self.flaky.iter().any(|id| prompt.ends_with(modifier(id))) && n % 2 == 0 {
                return Err(GenerationError::EmptyOutput("flaky".to_string()));
            }
            Ok(format!("data:image/png;base64,{n}"))
        }
    }

    #[test]
    fn count_normalization() {
        assert_eq!(normalize_count(&json!(0), 10), 1);
        assert_eq!(normalize_count(&json!(-3), 10), 1);
        assert_eq!(normalize_count(&json!("abc"), 10), 1);
        assert_eq!(normalize_count(&json!(15), 10), 10);
        assert_eq!(normalize_count(&json!(2.9), 10), 2);
        assert_eq!(normalize_count(&json!("4"), 10), 4);
        assert_eq!(normalize_count(&Value::Null, 10), 1);
    }

    #[test]
    fn plan_dedups_and_drops_unknown_styles() {
        let plan = plan(&ids(&["neon", "sepia", "neon", "flat"]), 2, "текст", "", &limits()).unwrap();
        let styles: Vec<_> = plan.units.iter().map(|u| u.style.as_str()).collect();
        assert_eq!(styles, vec!["neon", "flat"]);
        assert_eq!(plan.total_images(), 4);
    }

    #[test]
    fn plan_refuses_empty_style_set() {
        let err = plan(&ids(&["sepia"]), 1, "текст", "", &limits()).unwrap_err();
        assert!(matches!(err, FanoutError::NoValidStyles));
    }

    #[test]
    fn plan_refuses_oversized_batch() {
        let err = plan(&ids(&["neon", "flat", "3d", "cartoon"]), 10, "текст", "", &limits()).unwrap_err();
        assert!(matches!(err, FanoutError::TooManyImages { requested: 40, max: 30 }));
    }

    #[tokio::test]
    async fn oversized_batch_never_reaches_the_gateway() {
        let gateway = Arc::new(FakeImages::new(vec![]));
        let result = plan(&ids(&["neon", "flat", "3d", "cartoon"]), 10, "текст", "", &limits());
        assert!(result.is_err());
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn one_failing_style_does_not_sink_the_batch() {
        let gateway = Arc::new(FakeImages::new(vec!["neon"]));
        let p = plan(&ids(&["neon", "flat", "3d"]), 2, "текст", "", &limits()).unwrap();
        let outcome = run(gateway.clone(), p, ExecutionMode::Parallel, 4).await;

        assert_eq!(outcome.images.len(), 4);
        assert!(outcome.images.iter().all(|i| i.style != "neon"));
        assert_eq!(outcome.style_errors.len(), 1);
        assert_eq!(outcome.style_errors[0].style, "neon");
        assert_eq!(outcome.style_errors[0].message, "Failed to generate any images");
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 6);
        assert!(outcome.into_result().is_ok());
    }

    #[tokio::test]
    async fn failed_unit_reports_a_generic_message() {
        struct Overloaded;

        #[async_trait]
        impl GenerationGateway for Overloaded {
            async fn generate_text(&self, _prompt: &str) -> Result<String, GenerationError> {
                unreachable!()
            }

            async fn generate_image(&self, _prompt: &str) -> Result<String, GenerationError> {
                Err(GenerationError::Upstream {
                    status: 503,
                    body: "overloaded".to_string(),
                })
            }
        }

        let p = plan(&ids(&["neon"]), 3, "текст", "", &limits()).unwrap();
        let outcome = run(Arc::new(Overloaded), p, ExecutionMode::Parallel, 4).await;

        assert!(outcome.images.is_empty());
        assert_eq!(
            outcome.style_errors,
            vec![StyleError {
                style: "neon".to_string(),
                message: "Failed to generate any images".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn every_style_is_accounted_for() {
        let gateway = Arc::new(FakeImages::new(vec!["flat", "vintage"]));
        let requested = ids(&["neon", "flat", "3d", "vintage", "cartoon"]);
        let p = plan(&requested, 1, "текст", "", &limits()).unwrap();
        let outcome = run(gateway, p, ExecutionMode::Parallel, 4).await;

        let succeeded: HashSet<_> = outcome.images.iter().map(|i| i.style.clone()).collect();
        assert_eq!(succeeded.len() + outcome.style_errors.len(), requested.len());
    }

    #[tokio::test]
    async fn partial_unit_counts_as_success() {
        let mut fake = FakeImages::new(vec![]);
        fake.flaky = vec!["neon"];
        let p = plan(&ids(&["neon"]), 4, "текст", "", &limits()).unwrap();
        let outcome = run(Arc::new(fake), p, ExecutionMode::Sequential, 4).await;

        assert_eq!(outcome.images.len(), 2);
        assert!(outcome.style_errors.is_empty());
    }

    #[tokio::test]
    async fn total_failure_lists_every_style() {
        let failing = vec!["neon", "flat", "3d"];
        let gateway = Arc::new(FakeImages::new(failing.clone()));
        let p = plan(&ids(&failing), 3, "текст", "", &limits()).unwrap();
        let outcome = run(gateway, p, ExecutionMode::Parallel, 4).await;

        assert!(outcome.images.is_empty());
        match outcome.into_result() {
            Err(FanoutError::AllFailed { style_errors }) => assert_eq!(style_errors.len(), 3),
            other => panic!("expected total failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bounded_mode_caps_in_flight_calls() {
        let gateway = Arc::new(FakeImages::new(vec![]));
        let p = plan(&ids(&["neon", "flat", "3d"]), 5, "текст", "", &limits()).unwrap();
        let outcome = run(gateway.clone(), p, ExecutionMode::Bounded, 2).await;

        assert_eq!(outcome.images.len(), 15);
        assert_eq!(gateway.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sequential_mode_still_runs_styles_together() {
        let gateway = Arc::new(FakeImages::new(vec![]));
        let p = plan(&ids(&["neon", "flat", "3d"]), 2, "текст", "", &limits()).unwrap();
        let outcome = run(gateway.clone(), p, ExecutionMode::Sequential, 4).await;

        assert_eq!(outcome.images.len(), 6);
        // One call per style at a time, but the styles overlap.
        assert!(gateway.peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn panicking_unit_is_recorded_not_propagated() {
        struct Panicky;

        #[async_trait]
        impl GenerationGateway for Panicky {
            async fn generate_text(&self, _prompt: &str) -> Result<String, GenerationError> {
                unreachable!()
            }

            async fn generate_image(&self, prompt: &str) -> Result<String, GenerationError> {
                if prompt.ends_with(modifier("neon")) {
                    panic!("backend client bug");
                }
                Ok("https://cdn.example/ok.png".to_string())
            }
        }

        let p = plan(&ids(&["neon", "flat"]), 1, "текст", "", &limits()).unwrap();
        let outcome = run(Arc::new(Panicky), p, ExecutionMode::Parallel, 4).await;

        assert_eq!(outcome.images.len(), 1);
        assert_eq!(
            outcome.style_errors,
            vec![StyleError {
                style: "neon".to_string(),
                message: "Unknown generation error".to_string(),
            }]
        );
    }
}
