//! Program: the ordered arenas of parameter and residual blocks.

use crate::core::cost_function::CostFunction;
use crate::core::loss_functions::LossFunction;
use crate::core::manifold::Manifold;
use crate::core::parameter_block::{ParameterBlock, ParameterBlockId, UNSET_OFFSET};
use crate::core::residual_block::{ResidualBlock, ResidualBlockId};
use crate::core::{CoreError, CoreResult};
use nalgebra::DVector;

/// A nonlinear least-squares problem.
///
/// Insertion order is the canonical order: it defines the packed ambient
/// state vector (all blocks) and the tangent delta vector (varying blocks
/// with a nonzero tangent size). Offsets are assigned by
/// [`setup_offsets`](Program::setup_offsets) and must be refreshed whenever a
/// block's constancy changes.
#[derive(Default)]
pub struct Program {
    parameter_blocks: Vec<ParameterBlock>,
    residual_blocks: Vec<ResidualBlock>,
}

impl Program {
    pub fn new() -> Self {
        Program::default()
    }

    /// Add a Euclidean parameter block, returning its handle.
    pub fn add_parameter_block(&mut self, state: DVector<f64>) -> ParameterBlockId {
        let id = self.parameter_blocks.len();
        self.parameter_blocks.push(ParameterBlock::new(state));
        id
    }

    /// Add a parameter block with an attached manifold.
    pub fn add_parameter_block_with_manifold(
        &mut self,
        state: DVector<f64>,
        manifold: Box<dyn Manifold>,
    ) -> CoreResult<ParameterBlockId> {
        let mut block = ParameterBlock::new(state);
        block.set_manifold(manifold)?;
        let id = self.parameter_blocks.len();
        self.parameter_blocks.push(block);
        Ok(id)
    }

    /// Add a residual block over the given parameter blocks.
    ///
    /// The cost function's declared block sizes must match the referenced
    /// blocks.
    pub fn add_residual_block(
        &mut self,
        cost_function: Box<dyn CostFunction>,
        loss: Option<Box<dyn LossFunction>>,
        parameter_blocks: &[ParameterBlockId],
    ) -> CoreResult<ResidualBlockId> {
        let expected_sizes = cost_function.parameter_block_sizes();
        if expected_sizes.len() != parameter_blocks.len() {
            return Err(CoreError::ResidualBlock(format!(
                "cost function expects {} parameter blocks, got {}",
                expected_sizes.len(),
                parameter_blocks.len()
            ))
            .log());
        }
        for (&id, &expected) in parameter_blocks.iter().zip(expected_sizes.iter()) {
            let block = self.parameter_blocks.get(id).ok_or_else(|| {
                CoreError::ResidualBlock(format!("unknown parameter block id {id}")).log()
            })?;
            if block.size() != expected {
                return Err(CoreError::DimensionMismatch(format!(
                    "parameter block {id} has size {}, cost function expects {expected}",
                    block.size()
                ))
                .log());
            }
        }
        if cost_function.num_residuals() == 0 {
            return Err(
                CoreError::ResidualBlock("cost function has zero residuals".to_string()).log(),
            );
        }

        let id = self.residual_blocks.len();
        self.residual_blocks.push(ResidualBlock::new(
            cost_function,
            loss,
            parameter_blocks.to_vec(),
        ));
        Ok(id)
    }

    pub fn parameter_blocks(&self) -> &[ParameterBlock] {
        &self.parameter_blocks
    }

    pub fn residual_blocks(&self) -> &[ResidualBlock] {
        &self.residual_blocks
    }

    pub fn parameter_block(&self, id: ParameterBlockId) -> &ParameterBlock {
        &self.parameter_blocks[id]
    }

    pub fn parameter_block_mut(&mut self, id: ParameterBlockId) -> &mut ParameterBlock {
        &mut self.parameter_blocks[id]
    }

    /// Assign state, delta, and residual offsets in canonical order.
    ///
    /// Every block gets a `state_offset`; varying blocks with a nonzero
    /// tangent size additionally get a dense `index` and `delta_offset`.
    pub fn setup_offsets(&mut self) {
        let mut state_offset = 0;
        let mut delta_offset = 0;
        let mut index = 0;
        for block in &mut self.parameter_blocks {
            block.state_offset = state_offset;
            state_offset += block.size();
            if !block.is_constant() && block.tangent_size() > 0 {
                block.index = index;
                block.delta_offset = delta_offset;
                index += 1;
                delta_offset += block.tangent_size();
            } else {
                block.index = UNSET_OFFSET;
                block.delta_offset = UNSET_OFFSET;
            }
        }

        let mut residual_offset = 0;
        for (i, block) in self.residual_blocks.iter_mut().enumerate() {
            block.index = i;
            block.residual_offset = residual_offset;
            residual_offset += block.num_residuals();
        }
    }

    /// Total ambient dimension over all blocks.
    pub fn num_parameters(&self) -> usize {
        self.parameter_blocks.iter().map(|b| b.size()).sum()
    }

    /// Total tangent dimension over varying blocks.
    pub fn num_effective_parameters(&self) -> usize {
        self.parameter_blocks
            .iter()
            .filter(|b| !b.is_constant())
            .map(|b| b.tangent_size())
            .sum()
    }

    /// Total number of residual rows.
    pub fn num_residuals(&self) -> usize {
        self.residual_blocks.iter().map(|b| b.num_residuals()).sum()
    }

    pub fn has_bounds(&self) -> bool {
        self.parameter_blocks.iter().any(|b| b.has_bounds())
    }

    /// Pack all block states into one ambient vector in canonical order.
    pub fn state_vector(&self) -> DVector<f64> {
        let mut state = DVector::zeros(self.num_parameters());
        for block in &self.parameter_blocks {
            state
                .rows_mut(block.state_offset, block.size())
                .copy_from(block.state());
        }
        state
    }

    /// Copy a packed ambient vector back into the block states.
    pub fn set_state_vector(&mut self, state: &DVector<f64>) -> CoreResult<()> {
        if state.len() != self.num_parameters() {
            return Err(CoreError::DimensionMismatch(format!(
                "state vector has length {}, program has {} parameters",
                state.len(),
                self.num_parameters()
            ))
            .log());
        }
        for block in &mut self.parameter_blocks {
            let segment = state.rows(block.state_offset, block.size()).into_owned();
            block.set_state(segment)?;
        }
        Ok(())
    }

    /// Block-wise retraction of a tangent delta across the whole state
    /// vector. Constant blocks are copied through unchanged. Returns false
    /// when any block retraction fails.
    pub fn plus(&self, x: &DVector<f64>, delta: &DVector<f64>, x_plus_delta: &mut DVector<f64>) -> bool {
        if x.len() != self.num_parameters()
            || delta.len() != self.num_effective_parameters()
            || x_plus_delta.len() != self.num_parameters()
        {
            return false;
        }
        for block in &self.parameter_blocks {
            let size = block.size();
            let x_block = x.rows(block.state_offset, size);
            if block.is_constant() || block.tangent_size() == 0 {
                x_plus_delta
                    .rows_mut(block.state_offset, size)
                    .copy_from(&x_block);
                continue;
            }
            let delta_block = delta.rows(block.delta_offset, block.tangent_size());
            let mut out = DVector::zeros(size);
            if !block.plus(x_block, delta_block, &mut out) {
                return false;
            }
            x_plus_delta
                .rows_mut(block.state_offset, size)
                .copy_from(&out);
        }
        true
    }

    /// Residual block indices that reference the given parameter block.
    pub fn residual_blocks_for_parameter_block(&self, id: ParameterBlockId) -> Vec<ResidualBlockId> {
        self.residual_blocks
            .iter()
            .enumerate()
            .filter(|(_, block)| block.parameter_blocks().contains(&id))
            .map(|(i, _)| i)
            .collect()
    }
}
