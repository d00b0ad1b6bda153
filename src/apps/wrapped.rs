//! Wrapped app: a base app plus scheduled anomaly events

use async_trait::async_trait;
use chrono::{DateTime, Local};
use rand::rngs::StdRng;

use flowsynth_common::Pod;

use crate::apps::events::Event;
use crate::apps::{App, NodeChannels};
use crate::error::{Result, SynthError};

/// Delegates normal traffic to the base app, then fires every event whose
/// instant falls inside the window.
pub struct WrappedApp {
    base: Box<dyn App>,
    events: Vec<Event>,
    rng: StdRng,
}

impl WrappedApp {
    pub fn new(base: Box<dyn App>, events: Vec<Event>, rng: StdRng) -> Self {
        Self { base, events, rng }
    }
}

#[async_trait]
impl App for WrappedApp {
    async fn generate(
        &mut self,
        start: DateTime<Local>,
        end: DateTime<Local>,
        channels: &NodeChannels,
    ) -> Result<()> {
        self.base.generate(start, end, channels).await?;

        for i in 0..self.events.len() {
            if !self.events[i].due(start, end) {
                continue;
            }
            let service = self.events[i].service.clone();
            let victim = self
                .base
                .pod_by_service(&service)
                .ok_or(SynthError::UnknownService { service })?;
            self.events[i]
                .inject(&victim, channels, &mut self.rng)
                .await?;
        }

        Ok(())
    }

    fn pod_by_service(&mut self, service: &str) -> Option<Pod> {
        self.base.pod_by_service(service)
    }
}
