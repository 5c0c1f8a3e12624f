//! Core interfaces for builders.
//!
//! Building an image is organized as a pipeline of steps sharing a typed context.
//! See [`Step`] and [`Pipeline`].

use anyhow::{Context as _, Result};
use log::debug;

/// Step in the pipeline.
pub trait Step<Ctx> {
    /// Short human-readable name, used in logs and error messages.
    fn name(&self) -> &'static str;

    /// Run step.
    fn run(&mut self, ctx: &mut Ctx) -> Result<()>;
}

/// Steps of the pipeline.
pub type Steps<Ctx> = Vec<Box<dyn Step<Ctx>>>;

/// Direct pipeline, running steps in order of appearance.
///
/// The first failing step stops the pipeline. Resources acquired by earlier steps
/// live in the context and are released when the context is dropped.
pub struct Pipeline<'ctx, Ctx> {
    ctx: &'ctx mut Ctx,
    steps: Steps<Ctx>,
}

impl<'ctx, Ctx> Pipeline<'ctx, Ctx> {
    /// Create new pipeline with given context.
    pub fn from_ctx(ctx: &'ctx mut Ctx) -> Self {
        Self {
            ctx,
            steps: Vec::new(),
        }
    }

    /// Add step to the end of pipeline.
    pub fn add_step(&mut self, step: Box<dyn Step<Ctx>>) {
        self.steps.push(step);
    }

    /// Add steps to the end of pipeline.
    pub fn add_steps<I>(&mut self, steps: I)
    where
        I: IntoIterator<Item = Box<dyn Step<Ctx>>>,
    {
        for step in steps.into_iter() {
            self.add_step(step);
        }
    }

    /// Create new pipeline with given context and steps.
    pub fn from_steps<I>(ctx: &'ctx mut Ctx, steps: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn Step<Ctx>>>,
    {
        let mut pipeline = Self::from_ctx(ctx);
        pipeline.add_steps(steps);
        pipeline
    }

    /// Run pipeline.
    pub fn run(self) -> Result<()> {
        let ctx = self.ctx;
        for mut step in self.steps {
            debug!("step: {}", step.name());
            step.run(ctx)
                .with_context(|| format!("failed to {}", step.name()))?;
        }
        Ok(())
    }
}
