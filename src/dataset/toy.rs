use rand::{rngs::StdRng, Rng, SeedableRng};

use super::data::StrokeRecordRaw;

/// Synthetic growth cases: a spherical core that grows into a larger
/// penumbra sphere, with the follow-up lesion in between.
#[derive(Clone, Debug)]
pub struct ToyGrowth {
    pub samples: usize,
    /// `[depth, height, width]`.
    pub spatial: [usize; 3],
    pub sequence_length: usize,
    pub num_globals: usize,
    pub seed: u64,
}

impl ToyGrowth {
    pub fn generate(&self) -> Vec<StrokeRecordRaw> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        (0..self.samples).map(|_| self.sample(&mut rng)).collect()
    }

    fn sample(&self, rng: &mut StdRng) -> StrokeRecordRaw {
        let last = self.sequence_length.saturating_sub(1);
        // Leave at least two steps between core and penumbra.
        let t_core = rng.gen_range(0..last.max(1));
        let t_lesion = rng.gen_range(t_core..=last);

        let [depth, height, width] = self.spatial;
        let extent = height.min(width) as f32;
        let core_radius = rng.gen_range(0.08..0.15) * extent;
        let penumbra_radius = core_radius + rng.gen_range(0.1..0.2) * extent;
        let progress = (t_lesion - t_core) as f32 / (last - t_core).max(1) as f32;
        let lesion_radius = core_radius + progress * (penumbra_radius - core_radius);

        // Centred on a voxel so even the smallest core covers that voxel.
        let jitter = (0.1 * extent) as isize;
        let mut voxel_center = |size: usize, jitter: isize| {
            let offset = rng.gen_range(-jitter..=jitter);
            let size = size.max(1) as isize;
            (size / 2 + offset).clamp(0, size - 1) as f32 + 0.5
        };
        let center = [
            voxel_center(depth, 0),
            voxel_center(height, jitter),
            voxel_center(width, jitter),
        ];

        let mut globals = vec![t_core as f32, (t_lesion - t_core) as f32];
        globals.extend((2..self.num_globals.max(2)).map(|_| rng.gen_range(0.0..1.0f32)));

        let mut label_values = Vec::with_capacity(3 * depth * height * width);
        for radius in [core_radius, lesion_radius, penumbra_radius] {
            label_values.extend(sphere(self.spatial, center, radius));
        }

        StrokeRecordRaw {
            spatial: self.spatial,
            globals,
            label_values,
        }
    }
}

/// Binary ball mask in voxel units.
fn sphere(spatial: [usize; 3], center: [f32; 3], radius: f32) -> Vec<f32> {
    let [depth, height, width] = spatial;
    let mut mask = Vec::with_capacity(depth * height * width);
    for z in 0..depth {
        for y in 0..height {
            for x in 0..width {
                let dz = z as f32 + 0.5 - center[0];
                let dy = y as f32 + 0.5 - center[1];
                let dx = x as f32 + 0.5 - center[2];
                let inside = dz * dz + dy * dy + dx * dx <= radius * radius;
                mask.push(if inside { 1.0 } else { 0.0 });
            }
        }
    }
    mask
}
