// training_resume.rs
// Description: End to end session tests: terminal checkpoint, resume, interrupt checkpoint and
//              rejection of foreign checkpoints.
// History:
// - 2026-10-16: Add session level resume and interrupt tests.
// - 2026-10-19: Add epoch target, repeated run and epoch 50 of 2000 resume tests.
// Author: Marcus Schlieper

use std::path::Path;
use std::sync::atomic::Ordering;

use latent_ode_trainer::checkpoint::{self, CheckpointKind, CheckpointRecord};
use latent_ode_trainer::solver::{SolverConfig, SolverMethod};
use latent_ode_trainer::{EncoderKind, LatentOdeError, ModelDims, OdeVae, SeriesTensor, Session, TrainConfig, TrainOutcome};

fn series() -> SeriesTensor {
    let v_rows: Vec<Vec<f32>> = (0..4)
        .map(|s| (0..8).map(|t| ((s + 2 * t) % 6) as f32).collect())
        .collect();
    let v_times: Vec<Vec<f32>> = (0..4)
        .map(|s| (0..8).map(|t| t as f32 * (1.0 + 0.5 * s as f32)).collect())
        .collect();
    SeriesTensor::from_rows(&v_rows, Some(v_times.as_slice())).unwrap()
}

fn config(p_dir: &Path, i_epochs: usize, encoder: EncoderKind) -> TrainConfig {
    TrainConfig {
        i_epochs,
        i_batch_size: 3,
        i_n_sample: 5,
        encoder,
        opt_model_save_dir: Some(p_dir.join("model")),
        opt_training_save_dir: Some(p_dir.join("training")),
        dims: ModelDims {
            i_output_dim: 1,
            i_hidden_dim: 4,
            i_latent_dim: 2,
        },
        solver: SolverConfig {
            method: SolverMethod::Rk4,
            i_rk4_substeps: 2,
            ..SolverConfig::default()
        },
        ..TrainConfig::default()
    }
}

#[test]
fn finished_run_is_resumed_from_terminal_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let data = series();

    let first = Session::new(config(dir.path(), 3, EncoderKind::Cde)).unwrap();
    let r1 = first.run(&data, Some(&data)).unwrap();
    assert!(!r1.b_resumed);
    assert!(matches!(r1.outcome, TrainOutcome::Done { i_epoch_idx: 3, .. }));
    assert!(r1.opt_eval.is_some());

    let p_final = dir.path().join("model").join("ODE.json");
    assert_eq!(r1.opt_saved.as_deref(), Some(p_final.as_path()));
    let record = CheckpointRecord::load(&p_final).unwrap();
    assert_eq!(record.kind, CheckpointKind::Final);
    assert_eq!(record.s_encoder, "cde");
    assert!(record.opt_optimizer.is_some());
    assert_eq!(record.opt_series.clone().unwrap().into_series().unwrap(), data);
    assert!(record.opt_config.is_some());
    assert!(dir.path().join("training").join("ODE_2.json").exists());
    assert!(dir.path().join("training").join("ODE_3.json").exists());

    // The checkpoint's encoder wins over the requested one.
    let second = Session::new(config(dir.path(), 5, EncoderKind::Gru)).unwrap();
    let r2 = second.run(&data, None).unwrap();
    assert!(r2.b_resumed);
    match r2.outcome {
        TrainOutcome::Done { i_epoch_idx, v_history } => {
            assert_eq!(i_epoch_idx, 5);
            assert_eq!(v_history.len(), 5);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    let record = CheckpointRecord::load(&p_final).unwrap();
    assert_eq!(record.s_encoder, "cde");
    assert_eq!(record.i_epoch_idx, 5);
}

#[test]
fn suffixed_model_name_is_reduced_to_base_name() {
    let dir = tempfile::tempdir().unwrap();
    let data = series();

    Session::new(config(dir.path(), 2, EncoderKind::Gru)).unwrap().run(&data, None).unwrap();
    std::fs::rename(
        dir.path().join("model").join("ODE.json"),
        dir.path().join("model").join("ODE_2.json"),
    )
    .unwrap();

    let cfg = TrainConfig {
        s_model_name: "ODE_2".to_string(),
        ..config(dir.path(), 3, EncoderKind::Gru)
    };
    let r = Session::new(cfg).unwrap().run(&data, None).unwrap();
    assert!(r.b_resumed);
    assert_eq!(r.opt_saved, Some(dir.path().join("model").join("ODE.json")));
}

#[test]
fn interrupt_after_resume_writes_interrupt_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let data = series();
    Session::new(config(dir.path(), 2, EncoderKind::Gru)).unwrap().run(&data, None).unwrap();

    let session = Session::new(config(dir.path(), 4, EncoderKind::Gru)).unwrap();
    session.interrupt_flag().store(true, Ordering::SeqCst);
    let r = session.run(&data, None).unwrap();

    match &r.outcome {
        TrainOutcome::Interrupted {
            i_epoch_idx,
            v_partial_losses,
            v_history,
        } => {
            assert_eq!(*i_epoch_idx, 2);
            assert!(v_partial_losses.is_empty());
            assert_eq!(v_history.len(), 2);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    let p_interrupt = dir.path().join("training").join("ODE_2_interrupt.json");
    assert_eq!(r.opt_saved.as_deref(), Some(p_interrupt.as_path()));
    let record = CheckpointRecord::load(&p_interrupt).unwrap();
    assert_eq!(record.kind, CheckpointKind::Interrupt);
    assert_eq!(record.i_epoch_idx, 2);
}

#[test]
fn interrupt_in_first_epoch_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let session = Session::new(config(dir.path(), 4, EncoderKind::Gru)).unwrap();
    session.interrupt_flag().store(true, Ordering::SeqCst);
    let r = session.run(&series(), None).unwrap();
    assert!(matches!(r.outcome, TrainOutcome::Interrupted { i_epoch_idx: 0, .. }));
    assert!(r.opt_saved.is_none());
}

#[test]
fn foreign_encoder_tag_stops_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let data = series();
    Session::new(config(dir.path(), 1, EncoderKind::Gru)).unwrap().run(&data, None).unwrap();

    let p_final = dir.path().join("model").join("ODE.json");
    let mut record = CheckpointRecord::load(&p_final).unwrap();
    record.s_encoder = "lstm".to_string();
    record.save(&p_final).unwrap();

    let r = Session::new(config(dir.path(), 2, EncoderKind::Gru)).unwrap().run(&data, None);
    assert!(matches!(r, Err(LatentOdeError::UnknownEncoder(_))));
}

#[test]
fn save_dir_without_model_name_fails_in_strict_mode() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = TrainConfig {
        s_model_name: String::new(),
        ..config(dir.path(), 1, EncoderKind::Gru)
    };
    let r = Session::new(cfg).unwrap().run(&series(), None);
    assert!(matches!(r, Err(LatentOdeError::InvalidConfig(_))));
}

#[test]
fn target_below_checkpoint_epoch_is_rejected_and_checkpoint_survives() {
    let dir = tempfile::tempdir().unwrap();
    let data = series();
    Session::new(config(dir.path(), 5, EncoderKind::Gru)).unwrap().run(&data, None).unwrap();

    let p_final = dir.path().join("model").join("ODE.json");
    let s_before = std::fs::read_to_string(&p_final).unwrap();

    let r = Session::new(config(dir.path(), 3, EncoderKind::Gru)).unwrap().run(&data, None);
    assert!(matches!(r, Err(LatentOdeError::InvalidConfig(_))));
    assert_eq!(std::fs::read_to_string(&p_final).unwrap(), s_before);

    let r = Session::new(config(dir.path(), 7, EncoderKind::Gru)).unwrap().run(&data, None).unwrap();
    assert!(r.b_resumed);
    assert!(matches!(r.outcome, TrainOutcome::Done { i_epoch_idx: 7, .. }));
    assert_eq!(CheckpointRecord::load(&p_final).unwrap().i_epoch_idx, 7);
}

#[test]
fn session_runs_again_after_an_interrupt() {
    let dir = tempfile::tempdir().unwrap();
    let data = series();
    let session = Session::new(config(dir.path(), 2, EncoderKind::Gru)).unwrap();

    session.interrupt_flag().store(true, Ordering::SeqCst);
    let r1 = session.run(&data, None).unwrap();
    assert!(matches!(r1.outcome, TrainOutcome::Interrupted { i_epoch_idx: 0, .. }));
    assert!(!session.interrupt_flag().load(Ordering::SeqCst));

    let r2 = session.run(&data, None).unwrap();
    assert!(matches!(r2.outcome, TrainOutcome::Done { i_epoch_idx: 2, .. }));
}

#[test]
fn periodic_record_at_epoch_fifty_resumes_to_two_thousand() {
    let dir = tempfile::tempdir().unwrap();
    let p_runs = dir.path().join("runs");
    let short: Vec<Vec<f32>> = vec![vec![1.0, 3.0]];
    let data = SeriesTensor::from_rows(&short, None).unwrap();

    let mut cfg = TrainConfig {
        i_epochs: 2000,
        i_batch_size: 1,
        i_n_sample: 2,
        opt_model_save_dir: Some(p_runs.clone()),
        s_model_name: "ODE_51".to_string(),
        ..config(dir.path(), 2000, EncoderKind::Gru)
    };
    cfg.opt_training_save_dir = None;
    cfg.solver.i_rk4_substeps = 1;

    let model = OdeVae::new(EncoderKind::Gru, cfg.dims, &cfg.solver, 3).unwrap();
    let v_history: Vec<Vec<f32>> = vec![vec![1.0]; 51];
    let p_periodic = checkpoint::periodic_path(&p_runs, "ODE", 50);
    assert_eq!(p_periodic, p_runs.join("ODE_51.json"));
    CheckpointRecord::from_model(&model, CheckpointKind::Periodic, 50, 2000, &v_history)
        .save(&p_periodic)
        .unwrap();
    assert_eq!(CheckpointRecord::load(&p_periodic).unwrap().i_epoch_idx, 50);

    let session = Session::new(cfg).unwrap();
    let mut prepared = session.prepare().unwrap();
    assert!(prepared.b_resumed);
    assert_eq!(prepared.trainer.epoch_idx(), 50);
    assert_eq!(prepared.trainer.history().len(), 50);
    assert_eq!(prepared.trainer.config().s_model_name, "ODE");

    let outcome = prepared
        .trainer
        .train(&mut prepared.model, &mut prepared.optimizer, &data)
        .unwrap();
    match outcome {
        TrainOutcome::Done { i_epoch_idx, v_history } => {
            assert_eq!(i_epoch_idx, 2000);
            assert_eq!(v_history.len(), 2000);
            // 1950 epochs trained in this run, one batch each.
            assert!(v_history[50..].iter().all(|v| v.len() == 1));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
}
