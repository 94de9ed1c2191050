use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;
use serde::Deserialize;

use crate::error::ProblemError;

/// A question and its numeric answer. The answer never leaves the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
    pub question: String,
    pub answer: i64,
}

impl Problem {
    pub fn new(question: impl Into<String>, answer: i64) -> Self {
        Self {
            question: question.into(),
            answer,
        }
    }

    /// Addition derived from `seed`, used whenever the configured source fails.
    pub fn fallback(seed: u64) -> Self {
        let a = (seed % 20) as i64 + 1;
        let b = ((seed / 20) % 20) as i64 + 1;
        Self::new(format!("{} + {}", a, b), a + b)
    }

    /// Grades a submitted answer. Anything that is not a number is wrong.
    pub fn is_answered_by(&self, submitted: Option<&serde_json::Value>) -> bool {
        submitted
            .and_then(parse_answer)
            .is_some_and(|value| value == self.answer as f64)
    }
}

/// Accepts JSON numbers and numeric strings.
pub fn parse_answer(value: &serde_json::Value) -> Option<f64> {
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Supplies problems to rooms. Fetches may be slow or fail.
pub trait ProblemSource: Send + Sync {
    fn fetch(&self) -> BoxFuture<'static, Result<Problem, ProblemError>>;
}

/// Random arithmetic generated in-process.
#[derive(Debug, Default, Clone)]
pub struct LocalProblemSource;

impl LocalProblemSource {
    pub fn generate() -> Problem {
        let mut rng = rand::rng();
        match rng.random_range(0..3) {
            0 => {
                let a = rng.random_range(1..=20);
                let b = rng.random_range(1..=20);
                Problem::new(format!("{} + {}", a, b), a + b)
            }
            1 => {
                let a = rng.random_range(10..=29);
                let b = rng.random_range(1..=10);
                Problem::new(format!("{} - {}", a, b), a - b)
            }
            _ => {
                let a = rng.random_range(1..=10);
                let b = rng.random_range(1..=10);
                Problem::new(format!("{} × {}", a, b), a * b)
            }
        }
    }
}

impl ProblemSource for LocalProblemSource {
    fn fetch(&self) -> BoxFuture<'static, Result<Problem, ProblemError>> {
        futures::future::ready(Ok(Self::generate())).boxed()
    }
}

#[derive(Debug, Deserialize)]
struct RemoteProblem {
    question: String,
    answer: f64,
}

impl TryFrom<RemoteProblem> for Problem {
    type Error = ProblemError;

    fn try_from(raw: RemoteProblem) -> Result<Self, Self::Error> {
        let question = raw.question.trim();
        if question.is_empty() {
            return Err(ProblemError::Invalid("empty question".to_string()));
        }
        if !raw.answer.is_finite()
            || raw.answer.fract() != 0.0
            || raw.answer.abs() > (1u64 << 53) as f64
        {
            return Err(ProblemError::Invalid(format!(
                "answer {} is not an integer",
                raw.answer
            )));
        }
        Ok(Problem::new(question, raw.answer as i64))
    }
}

/// Fetches `{"question": ..., "answer": ...}` documents over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProblemSource {
    client: reqwest::Client,
    url: String,
}

impl HttpProblemSource {
    pub fn new(url: impl Into<String>) -> Result<Self, ProblemError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("mathrush/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl ProblemSource for HttpProblemSource {
    fn fetch(&self) -> BoxFuture<'static, Result<Problem, ProblemError>> {
        let request = self.client.get(&self.url);
        async move {
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(ProblemError::Unavailable(format!("status {}", status)));
            }
            let raw: RemoteProblem = response.json().await?;
            Problem::try_from(raw)
        }
        .boxed()
    }
}

/// Makes a single bounded attempt against `source`, then falls back.
pub async fn fetch_with_fallback(
    source: Arc<dyn ProblemSource>,
    timeout: Duration,
    seed: u64,
) -> Problem {
    let result = match tokio::time::timeout(timeout, source.fetch()).await {
        Ok(result) => result,
        Err(_) => Err(ProblemError::Timeout(timeout)),
    };

    match result {
        Ok(problem) => problem,
        Err(e) => {
            tracing::warn!(error = %e, "problem source failed, using fallback");
            Problem::fallback(seed)
        }
    }
}
