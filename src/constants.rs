//! Constants used throughout the pipeline

/// Frames sampled from each video by default
pub const DEFAULT_FRAME_COUNT: usize = 7;

/// Side length of the square face crop fed to the network
pub const DEFAULT_TARGET_SIZE: u32 = 224;

/// Number of colour channels in a frame
pub const FRAME_CHANNELS: usize = 3;

/// Pixel scale for converting 8-bit images to the unit range
pub const PIXEL_SCALE: f32 = 255.0;

/// Haar cascade detection parameters
pub const CASCADE_SCALE_FACTOR: f64 = 1.1;
pub const CASCADE_MIN_NEIGHBORS: i32 = 5;
pub const CASCADE_MIN_FACE_SIZE: i32 = 30;

/// Contrast limited adaptive histogram equalization defaults
pub const CLAHE_CLIP_LIMIT: f32 = 2.0;
pub const CLAHE_TILE_GRID: usize = 8;

/// Stabilizer inside the squash nonlinearity
pub const SQUASH_EPSILON: f32 = 1e-7;

/// Routing-by-agreement iterations
pub const DEFAULT_ROUTINGS: usize = 3;

/// Per-frame score above which a frame counts as fake
pub const FAKE_THRESHOLD: f32 = 0.5;

/// Tolerance used when fusion weights must sum to one
pub const FUSION_WEIGHT_SUM_TOLERANCE: f32 = 1e-4;

/// Gradient explainer attribution layer, counted from the end of the network
pub const DEFAULT_ATTRIBUTION_LAYER: isize = -3;

/// Central difference step for numeric activation gradients
pub const GRADIENT_STEP: f32 = 1e-3;

/// Perturbation explainer defaults
pub const DEFAULT_NUM_SAMPLES: usize = 1000;
pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_KERNEL_WIDTH: f64 = 0.25;
pub const DEFAULT_RIDGE_ALPHA: f64 = 1.0;
pub const DEFAULT_HIDE_COLOR: f32 = 0.0;
pub const DEFAULT_SEED: u64 = 42;

/// SLIC superpixel defaults
pub const DEFAULT_NUM_SEGMENTS: usize = 50;
pub const DEFAULT_COMPACTNESS: f32 = 10.0;
pub const DEFAULT_SLIC_ITERATIONS: usize = 10;

/// Boundary overlay colour (RGB, unit range)
pub const BOUNDARY_COLOR: [f32; 3] = [1.0, 1.0, 0.0];

/// Numeric precision epsilon
pub const EPSILON: f64 = 1e-10;
