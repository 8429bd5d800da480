//! Multi-rank collectives over localhost, one thread per rank.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarMap};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use voxtrain::distributed::{
    broadcast_parameters, CpuStagingSynchronizer, DistEnv, GradientSynchronizer, ProcessGroup,
};

const TIMEOUT: Duration = Duration::from_secs(20);

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Run `body` on `world_size` ranks and collect the results in rank order.
fn run_ranks<T, F>(world_size: usize, body: F) -> Vec<T>
where
    T: Send + 'static,
    F: Fn(ProcessGroup) -> T + Send + Sync + 'static,
{
    let port = free_port();
    let body = Arc::new(body);
    let handles: Vec<_> = (0..world_size)
        .map(|rank| {
            let body = Arc::clone(&body);
            thread::spawn(move || {
                let env = DistEnv {
                    rank,
                    world_size,
                    master_addr: "127.0.0.1".to_string(),
                    master_port: port,
                };
                let group = ProcessGroup::init(&env, TIMEOUT).unwrap();
                body(group)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn test_all_reduce_mean_across_three_ranks() {
    let results = run_ranks(3, |group| {
        let rank = group.rank() as f32;
        let mut buf = vec![rank, 10.0 * rank, 1.0];
        group.all_reduce_mean(&mut buf).unwrap();
        group.barrier().unwrap();
        buf
    });
    for buf in results {
        assert_eq!(buf, vec![1.0, 10.0, 1.0]);
    }
}

#[test]
fn test_broadcast_copies_rank_zero() {
    let results = run_ranks(2, |group| {
        let mut buf = if group.is_primary() {
            vec![4.0, 5.0]
        } else {
            vec![0.0, 0.0]
        };
        group.broadcast(&mut buf).unwrap();
        buf
    });
    assert_eq!(results, vec![vec![4.0, 5.0], vec![4.0, 5.0]]);
}

#[test]
fn test_parameters_start_identical() {
    let results = run_ranks(2, |group| {
        let varmap = VarMap::new();
        let init = Init::Const(group.rank() as f64 + 1.0);
        varmap.get(3, "encoder.w", init, DType::F32, &Device::Cpu).unwrap();
        broadcast_parameters(&group, &varmap).unwrap();
        let values = varmap.data().lock().unwrap()["encoder.w"]
            .as_tensor()
            .to_vec1::<f32>()
            .unwrap();
        values
    });
    for values in results {
        assert_eq!(values, vec![1.0, 1.0, 1.0]);
    }
}

#[test]
fn test_gradients_are_averaged() {
    let results = run_ranks(2, |group| {
        let rank = group.rank();
        let sync = CpuStagingSynchronizer::new(Arc::new(group));
        let varmap = VarMap::new();
        let w = varmap.get(2, "w", Init::Const(1.0), DType::F32, &Device::Cpu).unwrap();
        // d(sum(w * k))/dw = k
        let k = Tensor::new(&[(rank + 1) as f32, 3.0 * (rank + 1) as f32], &Device::Cpu).unwrap();
        let loss = (&w * &k).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();

        let synced = sync.synchronize_gradients(&grads, &varmap).unwrap();
        assert_eq!(synced.len(), 1);
        assert_eq!(synced[0].0, "w");
        synced[0].2.to_vec1::<f32>().unwrap()
    });
    for grad in results {
        assert_eq!(grad, vec![1.5, 4.5]);
    }
}
