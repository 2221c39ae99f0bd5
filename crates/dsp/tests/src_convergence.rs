//! End-to-end converter behaviour: startup, convergence, starvation.

#![allow(clippy::unwrap_used)] // tests use unwrap() for readable assertions

use dsp::converter::{
    BatchOutcome, SampleRate, SampleRateConverter, BATCH, BUF_IDEAL, BUF_TOTAL,
};

fn tone_chunk(len: usize, phase: &mut f64, freq_hz: f64, rate_hz: f64) -> Vec<i32> {
    (0..len)
        .map(|_| {
            let s = (*phase).sin();
            *phase += 2.0 * std::f64::consts::PI * freq_hz / rate_hz;
            (s * 0.25 * 2_147_483_647.0) as i32
        })
        .collect()
}

#[test]
fn startup_fills_then_goes_ready() {
    let mut src = SampleRateConverter::new().unwrap();
    src.configure(SampleRate::Hz48000).unwrap();
    assert!(!src.is_ready());

    let mut phase = 0.0;
    let mut writes = 0;
    while !src.is_ready() {
        let chunk = tone_chunk(48, &mut phase, 1000.0, 48_000.0);
        src.write_input([&chunk, &chunk], 0).unwrap();
        writes += 1;
        assert!(writes < 20, "converter never went ready");
    }
    // ready fires just past the ideal pre-fill level
    assert!(src.available_data() > BUF_IDEAL);
    assert!(src.mirror_invariant_holds());
}

#[test]
fn nominal_rate_converges_and_holds_fill_level() {
    let mut src = SampleRateConverter::new().unwrap();
    src.configure(SampleRate::Hz48000).unwrap();

    let mut phase = 0.0;
    // pre-fill
    while !src.is_ready() {
        let chunk = tone_chunk(48, &mut phase, 1000.0, 48_000.0);
        src.write_input([&chunk, &chunk], 0).unwrap();
    }

    let mut left = [0i32; BATCH];
    let mut right = [0i32; BATCH];
    for i in 0..200 {
        let chunk = tone_chunk(48, &mut phase, 1000.0, 48_000.0);
        src.write_input([&chunk, &chunk], 0).unwrap();
        let outcome = src.produce_batch([&mut left, &mut right]);
        assert_eq!(outcome, BatchOutcome::Produced, "iteration {i}");
    }

    // with a perfectly nominal source the mean rate error vanishes and the
    // adaptive step stays at the batch size
    assert!(src.average_rate_error().abs() < 0.1 / BATCH as f32);
    assert!((src.adaptive_step() - BATCH as f32).abs() < 0.5);

    // buffer level holds near the ideal fill
    let fill = src.available_data() as i64;
    assert!((fill - BUF_IDEAL as i64).abs() <= BATCH as i64 / 2 + BATCH as i64);
    assert!(src.mirror_invariant_holds());
}

#[test]
fn fast_source_is_absorbed_by_the_adaptive_step() {
    let mut src = SampleRateConverter::new().unwrap();
    src.configure(SampleRate::Hz96000).unwrap();

    let mut phase = 0.0;
    while !src.is_ready() {
        let chunk = tone_chunk(97, &mut phase, 1000.0, 96_100.0);
        src.write_input([&chunk, &chunk], 0).unwrap();
    }

    let mut left = [0i32; BATCH];
    let mut right = [0i32; BATCH];
    // source runs ~1 sample/batch fast; the step must absorb it
    for _ in 0..400 {
        let chunk = tone_chunk(97, &mut phase, 1000.0, 96_100.0);
        src.write_input([&chunk, &chunk], 0).unwrap();
        let _ = src.produce_batch([&mut left, &mut right]);
    }
    assert!(src.adaptive_step() > BATCH as f32 + 0.5);
    // fill must not run away
    assert!(src.available_data() < BUF_TOTAL - 1);
}

#[test]
fn starvation_parks_the_converter_until_refilled() {
    let mut src = SampleRateConverter::new().unwrap();
    src.configure(SampleRate::Hz48000).unwrap();

    let mut phase = 0.0;
    while !src.is_ready() {
        let chunk = tone_chunk(48, &mut phase, 1000.0, 48_000.0);
        src.write_input([&chunk, &chunk], 0).unwrap();
    }

    let mut left = [0i32; BATCH];
    let mut right = [0i32; BATCH];
    // drain without feeding
    let mut outcome = src.produce_batch([&mut left, &mut right]);
    let mut guard = 0;
    while outcome == BatchOutcome::Produced {
        outcome = src.produce_batch([&mut left, &mut right]);
        guard += 1;
        assert!(guard < 20);
    }
    assert_eq!(outcome, BatchOutcome::Starved);
    assert!(!src.is_ready());

    // further requests report not-ready, not starvation
    assert_eq!(
        src.produce_batch([&mut left, &mut right]),
        BatchOutcome::NotReady
    );

    // refill brings it back
    while !src.is_ready() {
        let chunk = tone_chunk(48, &mut phase, 1000.0, 48_000.0);
        src.write_input([&chunk, &chunk], 0).unwrap();
    }
    assert_eq!(
        src.produce_batch([&mut left, &mut right]),
        BatchOutcome::Produced
    );
}

#[test]
fn cd_rate_long_run_ratio_matches_conversion() {
    let mut src = SampleRateConverter::new().unwrap();
    src.configure(SampleRate::Hz44100).unwrap();

    let mut phase = 0.0;
    let mut fed: u64 = 0;
    let mut batches: u64 = 0;
    let mut left = [0i32; BATCH];
    let mut right = [0i32; BATCH];

    for _ in 0..4000 {
        // 44.1 kHz source: 44-or-45-sample chunks approximate 1 ms
        let n = if fed % 10 < 9 { 44 } else { 45 };
        let chunk = tone_chunk(n, &mut phase, 997.0, 44_100.0);
        src.write_input([&chunk, &chunk], 0).unwrap();
        fed += n as u64;
        if src.produce_batch([&mut left, &mut right]) == BatchOutcome::Produced {
            batches += 1;
        }
    }

    let produced = batches * BATCH as u64;
    let expected = fed as f64 * 96_000.0 / 44_100.0;
    let ratio = produced as f64 / expected;
    assert!((ratio - 1.0).abs() < 0.02, "ratio {ratio}");
    assert!(src.mirror_invariant_holds());
}

#[test]
fn overflow_discards_oldest_without_breaking_accounting() {
    let mut src = SampleRateConverter::new().unwrap();
    src.configure(SampleRate::Hz96000).unwrap();

    let chunk = vec![42i32; 128];
    // keep writing far past capacity
    for _ in 0..20 {
        src.write_input([&chunk, &chunk], 0).unwrap();
    }
    assert!(src.available_data() < BUF_TOTAL);
    assert!(src.mirror_invariant_holds());
}
