use std::cell::RefCell;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// Drawn once per process; tracers without an explicit seed start from it.
static PROCESS_SEED: Lazy<u64> = Lazy::new(rand::random);

pub fn process_seed() -> u64 {
    *PROCESS_SEED
}

static NEXT_SAMPLER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD_ORDINAL: AtomicU64 = AtomicU64::new(0);

// Random streams of the samplers used on this thread.
struct Stream {
    sampler: u64,
    alive: Weak<()>,
    rng: StdRng,
}

thread_local! {
    static THREAD_ORDINAL: u64 = NEXT_THREAD_ORDINAL.fetch_add(1, Ordering::Relaxed);
    static STREAMS: RefCell<Vec<Stream>> = const { RefCell::new(Vec::new()) };
}

/// Identifying context of one call, as seen by a [`Sampler`].
#[derive(Debug, Clone, Copy)]
pub struct CallSite<'a> {
    pub name: &'a str,
    /// Number of open spans on the calling context's stack.
    pub depth: usize,
    pub always_trace: bool,
    /// Per-function rate overriding the sampler's own.
    pub rate: Option<f64>,
}

impl<'a> CallSite<'a> {
    pub fn new(name: &'a str) -> Self {
        CallSite {
            name,
            depth: 0,
            always_trace: false,
            rate: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Skip,
    /// Chosen by the probabilistic policy. `weight` is the inverse of the
    /// effective rate; it is carried for consumers that opt into
    /// extrapolation and is not used by any built-in aggregate.
    Sample { weight: f64 },
    /// Chosen because the function is annotated always-trace.
    Forced,
}

impl Decision {
    pub fn is_traced(&self) -> bool {
        !matches!(self, Decision::Skip)
    }

    pub fn weight(&self) -> Option<f64> {
        match self {
            Decision::Skip => None,
            Decision::Sample { weight } => Some(*weight),
            Decision::Forced => Some(1.0),
        }
    }
}

/// Per-call tracing decision.
///
/// Implementations must be cheap and must not perform I/O: `decide` runs on
/// the instrumented call path for every invocation.
pub trait Sampler: Send + Sync + Debug {
    fn decide(&self, site: &CallSite<'_>) -> Decision;
}

/// Independent Bernoulli sampling at a fixed rate.
///
/// Each thread draws from its own stream, derived from the seed and the
/// order in which threads first sampled, so deciding never contends.
#[derive(Debug)]
pub struct BernoulliSampler {
    rate: f64,
    seed: u64,
    id: u64,
    alive: Arc<()>,
}

impl BernoulliSampler {
    pub fn new(rate: f64) -> Self {
        Self::with_seed(rate, process_seed())
    }

    pub fn with_seed(rate: f64, seed: u64) -> Self {
        BernoulliSampler {
            rate: clamp_rate(rate),
            seed,
            id: NEXT_SAMPLER_ID.fetch_add(1, Ordering::Relaxed),
            alive: Arc::new(()),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform draw in `[0, 1)` from this thread's stream. Draws 1.0, which
    /// never samples, while thread-local storage is unavailable.
    fn draw(&self) -> f64 {
        let drawn = THREAD_ORDINAL.try_with(|ordinal| {
            STREAMS.try_with(|streams| {
                let mut streams = streams.try_borrow_mut().ok()?;
                let at = match streams.iter().position(|s| s.sampler == self.id) {
                    Some(at) => at,
                    None => {
                        streams.retain(|s| s.alive.strong_count() > 0);
                        let seed = self
                            .seed
                            .wrapping_add(ordinal.wrapping_mul(0x9E37_79B9_7F4A_7C15));
                        streams.push(Stream {
                            sampler: self.id,
                            alive: Arc::downgrade(&self.alive),
                            rng: StdRng::seed_from_u64(seed),
                        });
                        streams.len() - 1
                    }
                };
                Some(streams[at].rng.gen::<f64>())
            })
        });
        match drawn {
            Ok(Ok(Some(draw))) => draw,
            _ => 1.0,
        }
    }
}

impl Sampler for BernoulliSampler {
    fn decide(&self, site: &CallSite<'_>) -> Decision {
        if site.always_trace {
            return Decision::Forced;
        }
        let rate = site.rate.map(clamp_rate).unwrap_or(self.rate);
        if rate >= 1.0 {
            return Decision::Sample { weight: 1.0 };
        }
        if rate <= 0.0 {
            return Decision::Skip;
        }
        if self.draw() < rate {
            Decision::Sample { weight: 1.0 / rate }
        } else {
            Decision::Skip
        }
    }
}

fn clamp_rate(rate: f64) -> f64 {
    if rate.is_nan() {
        0.0
    } else {
        rate.clamp(0.0, 1.0)
    }
}
