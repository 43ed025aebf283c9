// Changes the process-wide default backend, so it lives in its own binary.
use l1attn::backend::{get_backend, set_backend, Backend};
use l1attn::ops::dispatch::forward;
use l1attn::tensors::Ten32;
use l1attn::L1AttnError;

#[test]
fn test_default_backend_routes_free_calls() {
    let cpu_q = Ten32::zeros(vec![1, 2, 1, 4]);
    assert_eq!(cpu_q.backend(), Backend::Cpu);
    assert!(forward(&cpu_q, &cpu_q).is_ok());

    set_backend(Backend::Wgpu);
    assert_eq!(get_backend(), Backend::Wgpu);
    let result = forward(&cpu_q, &cpu_q);
    if Backend::Wgpu.is_available() {
        // a cpu-tagged tensor is refused by the wgpu kernels
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "q must be a wgpu tensor");
    } else {
        assert!(matches!(
            result,
            Err(L1AttnError::BackendUnavailable(Backend::Wgpu))
        ));
    }

    set_backend(Backend::Cpu);
    let q = Ten32::zeros(vec![1, 2, 1, 4]);
    assert_eq!(q.backend(), Backend::Cpu);
}
