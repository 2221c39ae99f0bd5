//! Polyphase filter coefficient generation.
//!
//! The resampler tables are windowed-sinc prototypes decomposed into phases
//! and quantised to Q31 at build time. The layout contract shared with
//! `ffir.rs`/`interp.rs`: `COEFFS[phase][tap]` where tap index runs from the
//! *oldest* delay-line sample to the newest, i.e. `c[taps-1]` multiplies the
//! current input sample.
//!
//! Each prototype is normalised so the average per-phase DC gain is exactly
//! one, then every phase is quantised independently. The tables are
//! deterministic for fixed parameters, which the golden-trace DSP tests rely
//! on.

use std::env;
use std::f64::consts::PI;
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

/// 2x interpolator: phases × taps-per-phase.
const INT2_PHASES: usize = 2;
const INT2_TAPS: usize = 110;

/// Fixed 160/147 resampler.
const F160147_PHASES: usize = 160;
const F160147_TAPS: usize = 20;

/// Adaptive resampler.
const ADAPTIVE_PHASES: usize = 96;
const ADAPTIVE_TAPS: usize = 50;
/// Cutoff margin of the adaptive prototype: the fractional step may run a
/// few percent above unity, so the passband edge backs off accordingly.
const ADAPTIVE_CUTOFF_SCALE: f64 = 0.92;

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Windowed-sinc prototype for a P-phase interpolator with per-phase DC gain
/// normalised to 1. `cutoff_scale` shifts the passband edge below the
/// theoretical 1/(2P).
fn prototype(phases: usize, taps: usize, cutoff_scale: f64) -> Vec<f64> {
    let len = phases * taps;
    let center = (len - 1) as f64 / 2.0;
    let fc = cutoff_scale / (2.0 * phases as f64);

    let mut h: Vec<f64> = (0..len)
        .map(|n| {
            let x = n as f64 - center;
            // Hann window
            let w = 0.5 - 0.5 * (2.0 * PI * n as f64 / (len - 1) as f64).cos();
            2.0 * fc * sinc(2.0 * fc * x) * w
        })
        .collect();

    // normalise: total DC gain of the prototype equals the phase count
    let sum: f64 = h.iter().sum();
    let scale = phases as f64 / sum;
    for v in &mut h {
        *v *= scale;
    }
    h
}

fn quantise(v: f64) -> i32 {
    let scaled = (v * 2_147_483_648.0).round();
    scaled.clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
}

/// Decompose the prototype into `COEFFS[phase][tap]`, oldest-first taps.
fn decompose(h: &[f64], phases: usize, taps: usize) -> Vec<Vec<i32>> {
    (0..phases)
        .map(|p| {
            (0..taps)
                .map(|tap| {
                    // tap index oldest-first: c[t] multiplies x[n-(taps-1-t)]
                    let j = taps - 1 - tap;
                    quantise(h[j * phases + p])
                })
                .collect()
        })
        .collect()
}

fn emit(out: &mut String, name: &str, table: &[Vec<i32>], taps: usize) {
    let phases = table.len();
    let _ = writeln!(
        out,
        "/// Generated windowed-sinc phase table ({phases} phases × {taps} taps)."
    );
    let _ = writeln!(
        out,
        "pub static {name}: [[i32; {taps}]; {phases}] = ["
    );
    for phase in table {
        let mut line = String::from("    [");
        for (i, c) in phase.iter().enumerate() {
            if i > 0 {
                line.push_str(", ");
            }
            let _ = write!(line, "{c}");
        }
        line.push_str("],");
        let _ = writeln!(out, "{line}");
    }
    let _ = writeln!(out, "];");
}

fn main() {
    let mut out = String::new();
    out.push_str("// @generated by build.rs — windowed-sinc polyphase tables.\n\n");

    let h = prototype(INT2_PHASES, INT2_TAPS, 1.0);
    emit(
        &mut out,
        "FIR_INT2_COEFFS",
        &decompose(&h, INT2_PHASES, INT2_TAPS),
        INT2_TAPS,
    );

    let h = prototype(F160147_PHASES, F160147_TAPS, 1.0);
    emit(
        &mut out,
        "FFIR_160147_COEFFS",
        &decompose(&h, F160147_PHASES, F160147_TAPS),
        F160147_TAPS,
    );

    let h = prototype(ADAPTIVE_PHASES, ADAPTIVE_TAPS, ADAPTIVE_CUTOFF_SCALE);
    emit(
        &mut out,
        "FFIR_ADAPTIVE_COEFFS",
        &decompose(&h, ADAPTIVE_PHASES, ADAPTIVE_TAPS),
        ADAPTIVE_TAPS,
    );

    let dest = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR set by cargo")).join("coeffs.rs");
    fs::write(&dest, out).expect("write generated coefficients");
    println!("cargo:rerun-if-changed=build.rs");
}
