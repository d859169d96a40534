//! Collective operations among training workers.

use crate::common::*;
use std::sync::PoisonError;

/// Collective operations of one worker within a fleet.
///
/// Every call blocks until all workers of the fleet make the same call.
/// Workers must issue collectives in the same order.
pub trait Reducer
where
    Self: Send,
{
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn barrier(&self) -> Result<()>;

    /// Collects one value vector from each rank, in rank order.
    fn all_gather(&self, values: Vec<f64>) -> Result<Vec<Vec<f64>>>;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Sums the tensor elementwise over all ranks and divides by the world size.
    fn reduce_mean(&self, tensor: &Tensor) -> Result<Tensor> {
        let values = tensor_to_vec(tensor);
        let gathered = self.all_gather(values)?;
        let world_size = gathered.len();
        let len = tensor.numel();

        let mut sum = vec![0f64; len];
        for values in &gathered {
            ensure!(
                values.len() == len,
                "expect {} elements from every rank, but get {}",
                len,
                values.len()
            );
            sum.iter_mut().zip(values).for_each(|(lhs, rhs)| *lhs += rhs);
        }
        let mean: Vec<f64> = sum.into_iter().map(|v| v / world_size as f64).collect();

        Ok(Tensor::of_slice(&mean)
            .view(tensor.size().as_slice())
            .to_kind(tensor.kind())
            .to_device(tensor.device()))
    }

    /// Concatenates the 1-D tensors of all ranks along the first dimension.
    fn gather_concat(&self, tensor: &Tensor) -> Result<Tensor> {
        ensure!(
            tensor.dim() == 1,
            "expect a 1-D tensor, but get shape {:?}",
            tensor.size()
        );
        let gathered = self.all_gather(tensor_to_vec(tensor))?;
        let values = gathered.concat();

        Ok(Tensor::of_slice(&values)
            .to_kind(tensor.kind())
            .to_device(tensor.device()))
    }
}

/// The reducer of a fleet with one worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Reducer for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn all_gather(&self, values: Vec<f64>) -> Result<Vec<Vec<f64>>> {
        Ok(vec![values])
    }
}

#[derive(Debug)]
struct GroupState {
    generation: u64,
    arrived: usize,
    aborted: bool,
    slots: Vec<Option<Vec<f64>>>,
}

#[derive(Debug)]
struct GroupShared {
    world_size: usize,
    state: Mutex<GroupState>,
    cvar: Condvar,
}

/// A fleet of workers living in one process, one thread per worker.
///
/// Aborting the group wakes every blocked worker with an error, so a
/// failure on one worker does not leave the others waiting forever.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<GroupShared>,
}

impl LocalGroup {
    /// Creates the handles of all ranks, in rank order.
    pub fn new(world_size: usize) -> Result<Vec<Self>> {
        ensure!(world_size > 0, "world_size must be positive");
        let shared = Arc::new(GroupShared {
            world_size,
            state: Mutex::new(GroupState {
                generation: 0,
                arrived: 0,
                aborted: false,
                slots: vec![None; world_size],
            }),
            cvar: Condvar::new(),
        });

        let handles = (0..world_size)
            .map(|rank| Self {
                rank,
                shared: shared.clone(),
            })
            .collect();
        Ok(handles)
    }

    pub fn abort(&self) {
        // a worker that panicked while holding the lock still aborts the group
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.aborted = true;
        drop(state);
        self.shared.cvar.notify_all();
    }

    /// Returns a guard that aborts the group when dropped, unless it is
    /// disarmed. Dropping happens on unwinding too, so a panicking worker
    /// releases its peers.
    pub fn abort_guard(&self) -> AbortGuard {
        AbortGuard {
            group: Some(self.clone()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, GroupState>> {
        self.shared
            .state
            .lock()
            .map_err(|_| format_err!("the worker group state is poisoned"))
    }
}

/// Aborts the worker group on drop. See [LocalGroup::abort_guard].
#[derive(Debug)]
pub struct AbortGuard {
    group: Option<LocalGroup>,
}

impl AbortGuard {
    pub fn disarm(mut self) {
        self.group = None;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if let Some(group) = self.group.take() {
            group.abort();
        }
    }
}

impl Reducer for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn barrier(&self) -> Result<()> {
        let mut state = self.lock()?;
        ensure!(!state.aborted, "the worker group was aborted");

        let generation = state.generation;
        state.arrived += 1;

        if state.arrived == self.shared.world_size {
            state.arrived = 0;
            state.generation += 1;
            self.shared.cvar.notify_all();
            return Ok(());
        }

        while state.generation == generation && !state.aborted {
            state = self
                .shared
                .cvar
                .wait(state)
                .map_err(|_| format_err!("the worker group state is poisoned"))?;
        }
        ensure!(
            state.generation != generation,
            "the worker group was aborted"
        );
        Ok(())
    }

    fn all_gather(&self, values: Vec<f64>) -> Result<Vec<Vec<f64>>> {
        self.lock()?.slots[self.rank] = Some(values);
        self.barrier()?;

        let gathered: Option<Vec<_>> = self.lock()?.slots.iter().cloned().collect();
        let gathered =
            gathered.ok_or_else(|| format_err!("a worker did not contribute to all_gather"))?;

        // keep the slots intact until every rank has read them
        self.barrier()?;
        Ok(gathered)
    }
}

/// Derives the seed of a worker from the master seed.
pub fn worker_seed(master: u64, rank: usize) -> u64 {
    splitmix64(master ^ splitmix64(rank as u64))
}

fn splitmix64(value: u64) -> u64 {
    let mut z = value.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Copies the parameters of rank zero to every other rank.
pub fn broadcast_parameters(reducer: &dyn Reducer, vs: &nn::VarStore) -> Result<()> {
    if reducer.world_size() == 1 {
        return Ok(());
    }

    let variables = sorted_variables(vs);
    let values = if reducer.is_root() {
        variables
            .iter()
            .flat_map(|(_, tensor)| tensor_to_vec(tensor))
            .collect()
    } else {
        vec![]
    };
    let gathered = reducer.all_gather(values)?;
    let root_values = &gathered[0];

    let total: usize = variables.iter().map(|(_, tensor)| tensor.numel()).sum();
    ensure!(
        root_values.len() == total,
        "parameter count mismatch: expect {}, but get {}",
        total,
        root_values.len()
    );

    if !reducer.is_root() {
        tch::no_grad(|| {
            let mut offset = 0;
            for (_, tensor) in &variables {
                let len = tensor.numel();
                let src = vec_to_tensor(&root_values[offset..offset + len], tensor);
                let mut dst = tensor.shallow_clone();
                dst.copy_(&src);
                offset += len;
            }
        });
    }

    Ok(())
}

/// Averages the gradients of trainable variables over all ranks.
pub fn sync_gradients(reducer: &dyn Reducer, vs: &nn::VarStore) -> Result<()> {
    if reducer.world_size() == 1 {
        return Ok(());
    }

    let variables = sorted_variables(vs);
    let grads: Vec<_> = variables
        .iter()
        .map(|(_, tensor)| {
            let grad = tensor.grad();
            if grad.defined() {
                grad
            } else {
                tensor.zeros_like()
            }
        })
        .collect();
    let values: Vec<f64> = grads.iter().flat_map(tensor_to_vec).collect();
    let gathered = reducer.all_gather(values)?;

    let len = gathered[0].len();
    ensure!(
        gathered.iter().all(|values| values.len() == len),
        "gradient size mismatch among ranks"
    );
    let world_size = gathered.len() as f64;
    let mean: Vec<f64> = (0..len)
        .map(|index| gathered.iter().map(|values| values[index]).sum::<f64>() / world_size)
        .collect();

    tch::no_grad(|| {
        let mut offset = 0;
        for ((_, tensor), grad) in variables.iter().zip(&grads) {
            let numel = grad.numel();
            let mut grad = tensor.grad();
            if grad.defined() {
                let src = vec_to_tensor(&mean[offset..offset + numel], &grad);
                grad.copy_(&src);
            }
            offset += numel;
        }
    });

    Ok(())
}

fn sorted_variables(vs: &nn::VarStore) -> Vec<(String, Tensor)> {
    vs.variables()
        .into_iter()
        .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
        .collect()
}

pub(crate) fn tensor_to_vec(tensor: &Tensor) -> Vec<f64> {
    let flat = tensor
        .detach()
        .to_device(Device::Cpu)
        .to_kind(Kind::Double)
        .reshape(&[-1]);
    Vec::<f64>::from(&flat)
}

fn vec_to_tensor(values: &[f64], like: &Tensor) -> Tensor {
    Tensor::of_slice(values)
        .view(like.size().as_slice())
        .to_kind(like.kind())
        .to_device(like.device())
}
