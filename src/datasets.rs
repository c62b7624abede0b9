//! Generates two dimensional binary classification datasets
//!
//! Points are `[x, y]` pairs and labels are class indices, 0 or 1.

use std::{
    f32::consts::PI,
    fmt::{self, Display},
};

use clap::ValueEnum;
use rand::Rng;

/// Toggles between dataset types
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Line,
    Circle,
    XOR,
    Moon,
}

impl Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Line => write!(f, "line"),
            Dataset::Circle => write!(f, "circle"),
            Dataset::XOR => write!(f, "xor"),
            Dataset::Moon => write!(f, "moon"),
        }
    }
}

pub type Points = (Vec<[f32; 2]>, Vec<usize>);

/// Loads a dataset based on the dataset type
pub fn load_dataset<R: Rng + ?Sized>(dataset: Dataset, class_size: usize, rng: &mut R) -> Points {
    match dataset {
        Dataset::Line => gen_linear_data(class_size, rng),
        Dataset::Circle => gen_circle_data(class_size, rng),
        Dataset::XOR => gen_xor_data(class_size, rng),
        Dataset::Moon => gen_moon_data(class_size, rng),
    }
}

/// Points on either side of the diagonal `x = y`
pub fn gen_linear_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Points {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for _ in 0..class_size {
        let x = rng.random_range(-5.0..5.0);
        let y = rng.random_range(-5.0..5.0);
        data.push([x, y]);
        labels.push(if x > y { 0 } else { 1 });
    }

    (data, labels)
}

/// Two concentric rings, class 0 inside
pub fn gen_circle_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Points {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for (class, radius) in [(0, 3.0f32), (1, 5.0f32)] {
        for _ in 0..class_size {
            let angle = rng.random_range(0.0..2.0 * PI);
            let radius_delta = radius * rng.random_range(-0.25..0.25);
            let x = (radius + radius_delta) * angle.cos();
            let y = (radius + radius_delta) * angle.sin();
            data.push([x, y]);
            labels.push(class);
        }
    }

    (data, labels)
}

/// Class 0 in the first and third quadrant
pub fn gen_xor_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Points {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for _ in 0..class_size {
        let x: f32 = rng.random_range(-5.0..5.0);
        let y: f32 = rng.random_range(-5.0..5.0);
        data.push([x, y]);
        labels.push(if x * y > 0.0 { 0 } else { 1 });
    }

    (data, labels)
}

/// Two interleaving partial circles
pub fn gen_moon_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Points {
    let mut data = Vec::new();
    let mut labels = Vec::new();
    let radius = 3.0;

    for class in 0..2 {
        for _ in 0..class_size {
            let theta: f32 = rng.random_range(-PI / 4.0..PI * 5.0 / 4.0);
            let (x, y) = if class == 0 {
                (radius * theta.cos(), radius * theta.sin())
            } else {
                (radius * theta.cos() + 2.0, -radius * theta.sin() - 0.2)
            };
            let noise_x = rng.random_range(-0.1..0.1);
            let noise_y = rng.random_range(-0.1..0.1);
            data.push([x + noise_x, y + noise_y]);
            labels.push(class);
        }
    }

    (data, labels)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    #[test]
    fn test_dataset_sizes() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        for (dataset, expected) in [
            (Dataset::Line, 10),
            (Dataset::Circle, 20),
            (Dataset::XOR, 10),
            (Dataset::Moon, 20),
        ] {
            let (data, labels) = load_dataset(dataset, 10, &mut rng);
            assert_eq!(data.len(), expected, "{}", dataset);
            assert_eq!(labels.len(), expected);
            assert!(labels.iter().all(|&l| l < 2));
        }
    }

    #[test]
    fn test_labels_follow_the_rule() {
        let mut rng = Pcg64Mcg::seed_from_u64(7);
        let (data, labels) = gen_xor_data(50, &mut rng);
        for ([x, y], label) in data.iter().zip(labels) {
            assert_eq!(label, if x * y > 0.0 { 0 } else { 1 });
        }
        let (data, labels) = gen_circle_data(50, &mut rng);
        for ([x, y], label) in data.iter().zip(labels) {
            let r = (x * x + y * y).sqrt();
            // rings are 3 +- 0.75 and 5 +- 1.25
            assert_eq!(label, if r < 3.75 { 0 } else { 1 });
        }
    }

    #[test]
    fn test_seeded_generation_is_reproducible() {
        let a = gen_moon_data(5, &mut Pcg64Mcg::seed_from_u64(3));
        let b = gen_moon_data(5, &mut Pcg64Mcg::seed_from_u64(3));
        assert_eq!(a, b);
    }
}
