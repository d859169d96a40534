//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use anyhow::Result;
use image::{GrayImage, Luma, Rgb, RgbImage};
use refseg_train::config::Config;
use std::{fs, path::Path, sync::Arc};

pub const NUM_SAMPLES: usize = 4;

/// Writes a JSON index dataset of boxes whose masks live next to the images.
pub fn write_dataset(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    let mut entries = vec![];

    for index in 0..NUM_SAMPLES {
        let offset = 4 + index as u32 * 2;
        let inside = |x: u32, y: u32| (offset..offset + 10).contains(&x) && (6..16).contains(&y);
        let image = RgbImage::from_fn(24, 30, |x, y| {
            if inside(x, y) {
                Rgb([230, 40, 40])
            } else {
                Rgb([20, 20, 200])
            }
        });
        let mask = GrayImage::from_fn(24, 30, |x, y| Luma([if inside(x, y) { 255 } else { 0 }]));
        image.save(dir.join(format!("{}.png", index)))?;
        mask.save(dir.join(format!("{}-mask.png", index)))?;

        entries.push(serde_json::json!({
            "key": index.to_string(),
            "image": format!("{}.png", index),
            "mask": format!("{}-mask.png", index),
            "mask_name": format!("{}-mask.png", index),
            "prompts": { "sentence": ["the red box", "red thing on the left"] },
        }));
    }

    fs::write(dir.join("index.json"), serde_json::to_string(&entries)?)?;
    Ok(())
}

pub fn write_config(root: &Path, data_dir: &Path) -> Result<Arc<Config>> {
    let text = format!(
        r#"{{
            model: {{ kind: "Baseline", vocab_size: 64, embed_dim: 8, hidden_channels: 4 }},
            dataset: {{
                train_dir: "{data}",
                val_dir: "{data}",
                test_dir: "{data}",
                mask_root: "{data}",
                input_size: 32,
                word_length: 8,
                prompt_type: "sentence",
                prefetch: 2,
            }},
            logging: {{ dir: "{runs}", exp_name: "pipeline" }},
            training: {{
                epochs: 2,
                batch_size: 2,
                batch_size_val: 2,
                lr_schedule: {{ type: "MultiStep", base_lr: 1e-3, milestones: [1], gamma: 0.1 }},
                max_norm: 1.0,
                print_freq: 1,
                seed: 3,
                device_config: {{ type: "SingleDevice", device: "cpu" }},
            }},
        }}"#,
        data = data_dir.display(),
        runs = root.join("runs").display(),
    );
    let path = root.join("train.json5");
    fs::write(&path, text)?;
    Ok(Arc::new(Config::open(&path)?))
}
