//! Compiled program bound to nothing yet
//!
//! An [`Executable`] is immutable and cheap to clone. Each execute call binds
//! it to a data set, runs it across that data's leaves and merges the
//! results.

use super::attribute_registry::AttributeRegistry;
use super::codegen::{POINT_KERNEL, POINT_RANGE_KERNEL, VOXEL_KERNEL};
use super::custom_data::CustomData;
use super::jit::ExecutionEngine;
use super::Target;
use crate::data::{GridCollection, PointDataGrid};
use crate::error::{Error, Result};
use crate::parallel::{self, ExecutionOptions, ExecutionStats};
use crate::runtime::{KernelEnv, Memory, Word};
use std::sync::Arc;

#[derive(Debug)]
struct Kernels {
    element: usize,
    range: Option<usize>,
}

#[derive(Debug)]
struct Inner {
    engine: ExecutionEngine,
    target: Target,
    access: AttributeRegistry,
    kernels: Kernels,
    warnings: Vec<String>,
}

/// Compiled kernels, their access registry and optional custom data
#[derive(Debug, Clone)]
pub struct Executable {
    inner: Arc<Inner>,
    custom_data: Option<Arc<CustomData>>,
}

impl Executable {
    pub(crate) fn new(
        engine: ExecutionEngine,
        target: Target,
        access: AttributeRegistry,
        warnings: Vec<String>,
    ) -> Result<Self> {
        let element_name = match target {
            Target::Points => POINT_KERNEL,
            Target::Volumes => VOXEL_KERNEL,
        };
        let element = engine
            .lookup(element_name)
            .ok_or_else(|| Error::execution(format!("missing kernel {}", element_name)))?;
        let range = match target {
            Target::Points => engine.lookup(POINT_RANGE_KERNEL),
            Target::Volumes => None,
        };
        Ok(Self {
            inner: Arc::new(Inner {
                engine,
                target,
                access,
                kernels: Kernels { element, range },
                warnings,
            }),
            custom_data: None,
        })
    }

    /// Data kind the kernels were compiled for
    pub fn target(&self) -> Target {
        self.inner.target
    }

    /// Attributes and externals the program accesses
    pub fn access(&self) -> &AttributeRegistry {
        &self.inner.access
    }

    /// Warnings logged while compiling
    pub fn warnings(&self) -> &[String] {
        &self.inner.warnings
    }

    /// Custom data read by `$name` accesses
    pub fn custom_data(&self) -> Option<&CustomData> {
        self.custom_data.as_deref()
    }

    /// Same kernels bound to `data`; the receiver is left untouched
    pub fn with_custom_data(&self, data: CustomData) -> Self {
        Self {
            inner: self.inner.clone(),
            custom_data: Some(Arc::new(data)),
        }
    }

    pub(crate) fn engine(&self) -> &ExecutionEngine {
        &self.inner.engine
    }

    pub(crate) fn element_kernel(&self) -> usize {
        self.inner.kernels.element
    }

    pub(crate) fn range_kernel(&self) -> Option<usize> {
        self.inner.kernels.range
    }

    fn expect_target(&self, target: Target) -> Result<()> {
        if self.inner.target != target {
            return Err(Error::execution(format!(
                "executable compiled for {:?} cannot run on {:?} data",
                self.inner.target, target
            )));
        }
        Ok(())
    }

    /// Run the point kernel over every point (or every point of `options.group`)
    pub fn execute_points(
        &self,
        grid: &mut PointDataGrid,
        options: &ExecutionOptions,
    ) -> Result<ExecutionStats> {
        self.expect_target(Target::Points)?;
        parallel::points::execute(self, grid, options)
    }

    /// Run the voxel kernel over the grids the program writes
    pub fn execute_volumes(
        &self,
        grids: &mut GridCollection,
        options: &ExecutionOptions,
    ) -> Result<ExecutionStats> {
        self.expect_target(Target::Volumes)?;
        parallel::volumes::execute(self, grids, options)
    }

    /// Invoke the element kernel directly with caller-provided handle arrays
    ///
    /// `handles` and `externals` must already be allocated in `memory`.
    pub fn call_element(
        &self,
        args: &[Word],
        memory: &mut Memory,
        env: &mut dyn KernelEnv,
    ) -> Result<Word> {
        self.engine().call(self.element_kernel(), args, memory, env)
    }
}
