//! Random numbers and noise

use super::native::{arg, array, write_array};
use super::{Availability, FunctionGroup, FunctionRegistry, Signature};
use crate::compiler::jit::CallContext;
use crate::error::Result;
use crate::runtime::Word;
use crate::types::{ScalarKind, Type};

const PERM: [u8; 256] = [
    151, 160, 137, 91, 90, 15, 131, 13, 201, 95, 96, 53, 194, 233, 7, 225, 140, 36, 103, 30, 69,
    142, 8, 99, 37, 240, 21, 10, 23, 190, 6, 148, 247, 120, 234, 75, 0, 26, 197, 62, 94, 252, 219,
    203, 117, 35, 11, 32, 57, 177, 33, 88, 237, 149, 56, 87, 174, 20, 125, 136, 171, 168, 68, 175,
    74, 165, 71, 134, 139, 48, 27, 166, 77, 146, 158, 231, 83, 111, 229, 122, 60, 211, 133, 230,
    220, 105, 92, 41, 55, 46, 245, 40, 244, 102, 143, 54, 65, 25, 63, 161, 1, 216, 80, 73, 209, 76,
    132, 187, 208, 89, 18, 169, 200, 196, 135, 130, 116, 188, 159, 86, 164, 100, 109, 198, 173, 186,
    3, 64, 52, 217, 226, 250, 124, 123, 5, 202, 38, 147, 118, 126, 255, 82, 85, 212, 207, 206, 59,
    227, 47, 16, 58, 17, 182, 189, 28, 42, 223, 183, 170, 213, 119, 248, 152, 2, 44, 154, 163, 70,
    221, 153, 101, 155, 167, 43, 172, 9, 129, 22, 39, 253, 19, 98, 108, 110, 79, 113, 224, 232, 178,
    185, 112, 104, 218, 246, 97, 228, 251, 34, 242, 193, 238, 210, 144, 12, 191, 179, 162, 241, 81,
    51, 145, 235, 249, 14, 239, 107, 49, 192, 214, 31, 181, 199, 106, 157, 184, 84, 204, 176, 115,
    121, 50, 45, 127, 4, 150, 254, 138, 236, 205, 93, 222, 114, 67, 29, 24, 72, 243, 141, 128, 195,
    78, 66, 215, 61, 156, 180,
];

const GRAD3: [[f64; 3]; 12] = [
    [1.0, 1.0, 0.0],
    [-1.0, 1.0, 0.0],
    [1.0, -1.0, 0.0],
    [-1.0, -1.0, 0.0],
    [1.0, 0.0, 1.0],
    [-1.0, 0.0, 1.0],
    [1.0, 0.0, -1.0],
    [-1.0, 0.0, -1.0],
    [0.0, 1.0, 1.0],
    [0.0, -1.0, 1.0],
    [0.0, 1.0, -1.0],
    [0.0, -1.0, -1.0],
];

fn perm(i: i64) -> i64 {
    PERM[(i & 255) as usize] as i64
}

/// 3D simplex noise in [-1, 1]
pub fn simplex3(x: f64, y: f64, z: f64) -> f64 {
    const F3: f64 = 1.0 / 3.0;
    const G3: f64 = 1.0 / 6.0;

    let s = (x + y + z) * F3;
    let (i, j, k) = ((x + s).floor(), (y + s).floor(), (z + s).floor());
    let t = (i + j + k) * G3;
    let x0 = [x - (i - t), y - (j - t), z - (k - t)];

    // offsets of the second and third corners
    let (o1, o2) = if x0[0] >= x0[1] {
        if x0[1] >= x0[2] {
            ([1, 0, 0], [1, 1, 0])
        } else if x0[0] >= x0[2] {
            ([1, 0, 0], [1, 0, 1])
        } else {
            ([0, 0, 1], [1, 0, 1])
        }
    } else if x0[1] < x0[2] {
        ([0, 0, 1], [0, 1, 1])
    } else if x0[0] < x0[2] {
        ([0, 1, 0], [0, 1, 1])
    } else {
        ([0, 1, 0], [1, 1, 0])
    };

    let corners: [[i64; 3]; 4] = [[0, 0, 0], o1, o2, [1, 1, 1]];
    let (ii, jj, kk) = (i as i64, j as i64, k as i64);
    corners
        .iter()
        .enumerate()
        .map(|(n, c)| {
            let offset = n as f64 * G3;
            let d = [
                x0[0] - c[0] as f64 + offset,
                x0[1] - c[1] as f64 + offset,
                x0[2] - c[2] as f64 + offset,
            ];
            let r = 0.6 - d[0] * d[0] - d[1] * d[1] - d[2] * d[2];
            if r < 0.0 {
                return 0.0;
            }
            let gi = perm(ii + c[0] + perm(jj + c[1] + perm(kk + c[2]))) % 12;
            let g = GRAD3[gi as usize];
            let r2 = r * r;
            r2 * r2 * (g[0] * d[0] + g[1] * d[1] + g[2] * d[2])
        })
        .sum::<f64>()
        * 32.0
}

/// Curl of a potential built from three decorrelated simplex fields
pub fn curl3(p: [f64; 3]) -> [f64; 3] {
    const EPS: f64 = 1e-4;
    const OFFSETS: [[f64; 3]; 3] = [[0.0, 0.0, 0.0], [123.4, 47.2, 91.7], [-77.1, 13.9, 201.3]];
    let potential = |q: [f64; 3], c: usize| {
        let o = OFFSETS[c];
        simplex3(q[0] + o[0], q[1] + o[1], q[2] + o[2])
    };
    let partial = |c: usize, axis: usize| {
        let mut hi = p;
        let mut lo = p;
        hi[axis] += EPS;
        lo[axis] -= EPS;
        (potential(hi, c) - potential(lo, c)) / (2.0 * EPS)
    };
    [
        partial(2, 1) - partial(1, 2),
        partial(0, 2) - partial(2, 0),
        partial(1, 0) - partial(0, 1),
    ]
}

/// Uniform value in [0, 1) determined by `seed`
pub fn random(seed: u64) -> f64 {
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    (z >> 11) as f64 / (1u64 << 53) as f64
}

fn rand_double(_: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    Ok(Word::F64(random(arg(args, 0)?.as_f64().to_bits())))
}

fn rand_int(_: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    Ok(Word::F64(random(arg(args, 0)?.as_i64() as u64)))
}

fn simplex_vec(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let p = array(ctx, args, 0, 3)?;
    Ok(Word::F64((simplex3(p[0], p[1], p[2]) + 1.0) * 0.5))
}

fn simplex_xyz(_: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let (x, y, z) = (arg(args, 0)?, arg(args, 1)?, arg(args, 2)?);
    Ok(Word::F64((simplex3(x.as_f64(), y.as_f64(), z.as_f64()) + 1.0) * 0.5))
}

fn curl_vec(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let p = array(ctx, args, 0, 3)?;
    write_array(ctx, args, 1, &curl3([p[0], p[1], p[2]]))?;
    Ok(Word::Void)
}

fn curl_xyz(ctx: &mut CallContext<'_>, args: &[Word]) -> Result<Word> {
    let p = [arg(args, 0)?.as_f64(), arg(args, 1)?.as_f64(), arg(args, 2)?.as_f64()];
    write_array(ctx, args, 3, &curl3(p))?;
    Ok(Word::Void)
}

pub(super) fn register(registry: &mut FunctionRegistry) {
    let vec3d = Type::vec(ScalarKind::Double, 3);
    registry.insert("rand", Availability::All, || {
        FunctionGroup::new("rand")
            .with(Signature::native(vec![Type::DOUBLE], Type::DOUBLE, rand_double))
            .with(Signature::native(vec![Type::INT64], Type::DOUBLE, rand_int))
    });
    registry.insert("simplexnoise", Availability::All, move || {
        FunctionGroup::new("simplexnoise")
            .with(Signature::native(vec![vec3d], Type::DOUBLE, simplex_vec))
            .with(Signature::native(vec![Type::DOUBLE; 3], Type::DOUBLE, simplex_xyz))
    });
    registry.insert("curlsimplexnoise", Availability::All, move || {
        FunctionGroup::new("curlsimplexnoise")
            .with(Signature::native_output(vec![vec3d], vec3d, curl_vec))
            .with(Signature::native_output(vec![Type::DOUBLE; 3], vec3d, curl_xyz))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_random_is_deterministic() {
        assert_eq!(random(7), random(7));
        assert_ne!(random(7), random(8));
    }

    #[test]
    fn test_simplex_at_lattice_origin() {
        assert_eq!(simplex3(0.0, 0.0, 0.0), 0.0);
    }

    proptest! {
        #[test]
        fn prop_simplex_is_bounded(x in -100.0f64..100.0, y in -100.0f64..100.0, z in -100.0f64..100.0) {
            let n = simplex3(x, y, z);
            prop_assert!((-1.0..=1.0).contains(&n));
        }

        #[test]
        fn prop_random_in_unit_interval(seed in any::<u64>()) {
            let r = random(seed);
            prop_assert!((0.0..1.0).contains(&r));
        }
    }
}
