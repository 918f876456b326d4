//! The environment the kohya_ss GUI runs in.

use crate::plan::{BuildPlan, BuildStep, PackageManager, PlanError};

pub const APP_NAME: &str = "kohya-ss-gui";
pub const BASE_IMAGE: &str = "nvidia/cuda:12.8.1-cudnn-devel-ubuntu24.04";
pub const PYTHON_VERSION: &str = "3.10";
pub const KOHYA_REPO_URL: &str = "https://github.com/bmaltais/kohya_ss.git";
pub const KOHYA_BASE: &str = "/kohya_ss";
pub const KOHYA_VERSION_DATE: &str = "2025-05-25";
pub const TORCH_INDEX_URL: &str = "https://download.pytorch.org/whl/cu128";

const APT_PACKAGES: &[&str] = &[
    "git",
    "wget",
    "libgl1",
    "libglib2.0-0",
    "python3-tk",
    "libjpeg-dev",
    "libpng-dev",
    "google-perftools",
    "libgl1-mesa-dri",
];

const TORCH_STACK: &[&str] = &["torch==2.8.0+cu128", "torchvision==0.23.0+cu128", "torchaudio==2.8.0+cu128"];

const TRAINING_EXTRAS: &[&str] = &["bitsandbytes==0.47.0", "diffusers==0.35.1", "accelerate==1.10.1"];

/// Packages stripped from kohya's requirements.txt and installed separately,
/// pinned to the CUDA 12.8 wheels.
const REINSTALLED: &[&str] = &["torch", "torchvision", "torchaudio", "xformers", "bitsandbytes"];

pub fn default_image_tag() -> String {
    format!("{APP_NAME}:{KOHYA_VERSION_DATE}")
}

pub fn kohya_plan() -> Result<BuildPlan, PlanError> {
    let strip_requirements = format!(
        "sed -i {} requirements.txt",
        REINSTALLED
            .iter()
            .map(|p| format!("-e '/{p}/d'"))
            .collect::<Vec<_>>()
            .join(" ")
    );

    BuildPlan::new(
        APP_NAME,
        vec![
            BuildStep::base_image(BASE_IMAGE, Some(PYTHON_VERSION)),
            BuildStep::env([
                ("DEBIAN_FRONTEND", "noninteractive"),
                ("TZ", "Etc/UTC"),
                ("PYTORCH_CUDA_ALLOC_CONF", "max_split_size_mb:128,expandable_segments:True"),
            ]),
            BuildStep::apt(APT_PACKAGES.iter().copied()),
            // Bumping the date invalidates every later layer.
            BuildStep::env([("KOHYA_VERSION_DATE", KOHYA_VERSION_DATE)]),
            BuildStep::env([("LD_PRELOAD", "/usr/lib/x86_64-linux-gnu/libtcmalloc_minimal.so.4")]),
            BuildStep::shell([
                "pip install --upgrade pip".to_string(),
                format!("git clone --recursive {KOHYA_REPO_URL} {KOHYA_BASE}"),
            ])
            .on_accelerator(),
            BuildStep::workdir(KOHYA_BASE),
            BuildStep::shell([
                strip_requirements,
                "echo '--- requirements.txt after removing the torch stack ---'".to_string(),
                "cat requirements.txt".to_string(),
                "pip install --use-pep517 --upgrade -r requirements.txt".to_string(),
                "pip uninstall -y torch torchvision torchaudio triton".to_string(),
            ])
            .on_accelerator(),
            BuildStep::install(PackageManager::Pip, TORCH_STACK.iter().copied(), ["--extra-index-url", TORCH_INDEX_URL])
                .on_accelerator(),
            BuildStep::install(PackageManager::Pip, ["xformers==0.0.32.post2"], ["--index-url", TORCH_INDEX_URL])
                .on_accelerator(),
            BuildStep::pip(TRAINING_EXTRAS.iter().copied()).on_accelerator(),
            // The volumes mount over these; the clone must not ship its own copies.
            BuildStep::shell(["accelerate config default", "rm -rf models dataset outputs configs", "ls -l"])
                .on_accelerator(),
            BuildStep::shell(["echo 'kohya_ss install complete'"]),
        ],
    )
}
