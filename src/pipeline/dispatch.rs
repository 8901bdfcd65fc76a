use crate::{
    error::SinkError,
    types::{Frame, FrameTimestamp, PoseResult},
};

/// One dispatched cycle: the processed frame and its smoothed pose, if any.
#[derive(Clone, Copy, Debug)]
pub struct Emission<'a> {
    pub timestamp: FrameTimestamp,
    pub frame: &'a Frame,
    pub pose: Option<&'a PoseResult>,
}

/// Downstream consumer of dispatched cycles. Sends must not block.
pub trait Sink: Send {
    fn name(&self) -> &'static str;

    fn send(&mut self, emission: &Emission<'_>) -> Result<(), SinkError>;
}

#[derive(Debug)]
pub struct SinkFailure {
    pub sink: &'static str,
    pub error: SinkError,
}

/// Fans every emission out to all sinks, without buffering or retries.
#[derive(Default)]
pub struct Dispatcher {
    sinks: Vec<Box<dyn Sink>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: impl Sink + 'static) -> Self {
        self.add_sink(sink);
        self
    }

    pub fn add_sink(&mut self, sink: impl Sink + 'static) {
        log::debug!("dispatcher: registered sink {}", sink.name());
        self.sinks.push(Box::new(sink));
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Hands the emission to every sink; a failing sink never skips the rest.
    pub fn emit(&mut self, emission: &Emission<'_>) -> Vec<SinkFailure> {
        let mut failures = Vec::new();
        for sink in &mut self.sinks {
            if let Err(error) = sink.send(emission) {
                log::debug!(
                    "sink {} failed for frame {}: {error}",
                    sink.name(),
                    emission.timestamp
                );
                failures.push(SinkFailure {
                    sink: sink.name(),
                    error,
                });
            }
        }
        failures
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sinks.iter().map(|sink| sink.name()))
            .finish()
    }
}
