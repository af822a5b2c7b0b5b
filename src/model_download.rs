use std::{
    fs,
    io::{Read, Write},
    path::Path,
    time::Duration,
};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;

use crate::{config::ModelSource, error::TrackerError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    FaceMesh,
    HandPose,
    PalmDetector,
}

impl ModelKind {
    pub fn label(&self) -> &'static str {
        match self {
            ModelKind::FaceMesh => "face mesh",
            ModelKind::HandPose => "hand pose",
            ModelKind::PalmDetector => "palm detector",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelDownloadEvent {
    AlreadyPresent { model: ModelKind },
    Started { model: ModelKind, total: Option<u64> },
    Progress { model: ModelKind, downloaded: u64, total: Option<u64> },
    Finished { model: ModelKind },
}

/// Makes sure the `model` file exists on disk, downloading it
/// from the configured URL when missing.
pub fn ensure_model_ready<F>(
    model: ModelKind,
    source: &ModelSource,
    mut on_event: F,
) -> Result<(), TrackerError>
where
    F: FnMut(ModelDownloadEvent),
{
    if source.path.exists() {
        on_event(ModelDownloadEvent::AlreadyPresent { model });
        on_event(ModelDownloadEvent::Finished { model });
        return Ok(());
    }

    let Some(url) = source.url.as_deref() else {
        return Err(TrackerError::Model(format!(
            "{} model not found at {} and no download url is configured",
            model.label(),
            source.path.display()
        )));
    };

    let mut progress: Option<ProgressBar> = None;
    download_to_path(model, url, &source.path, &mut |event| {
        match &event {
            ModelDownloadEvent::Started { total, .. } => {
                progress = Some(create_progress_bar(*total));
            }
            ModelDownloadEvent::Progress { downloaded, .. } => {
                if let Some(pb) = progress.as_ref() {
                    pb.set_position(*downloaded);
                }
            }
            ModelDownloadEvent::Finished { .. } => {
                if let Some(pb) = progress.take() {
                    pb.finish_with_message(format!("{} model ready", model.label()));
                }
            }
            ModelDownloadEvent::AlreadyPresent { .. } => {}
        }
        on_event(event);
    })
    .map_err(|err| TrackerError::Model(format!("{err:#}")))
}

fn download_to_path<F>(
    model: ModelKind,
    url: &str,
    dest: &Path,
    on_event: &mut F,
) -> anyhow::Result<()>
where
    F: FnMut(ModelDownloadEvent),
{
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create model directory {}", parent.display()))?;
    }

    log::info!(
        "downloading {} model from {url} to {}",
        model.label(),
        dest.display()
    );

    let client = Client::new();
    let mut response = client
        .get(url)
        .send()
        .context("failed to start model download")?
        .error_for_status()
        .context("model download returned error status")?;

    let total = response.content_length();
    on_event(ModelDownloadEvent::Started { model, total });

    let tmp_path = dest.with_extension("download");
    let mut file = fs::File::create(&tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; 16 * 1024];
    loop {
        let bytes_read = response
            .read(&mut buffer)
            .context("failed while reading model bytes")?;
        if bytes_read == 0 {
            break;
        }

        file.write_all(&buffer[..bytes_read])
            .context("failed while writing model to disk")?;
        downloaded += bytes_read as u64;
        on_event(ModelDownloadEvent::Progress {
            model,
            downloaded,
            total,
        });
    }

    file.sync_all()
        .context("failed to flush downloaded model to disk")?;
    fs::rename(&tmp_path, dest).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            tmp_path.display(),
            dest.display()
        )
    })?;

    on_event(ModelDownloadEvent::Finished { model });
    Ok(())
}

fn create_progress_bar(total_size: Option<u64>) -> ProgressBar {
    let bar_template = ProgressStyle::with_template(
        concat!(
            "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] ",
            "{bytes}/{total_bytes} ({eta})"
        ),
    );
    match (total_size, bar_template) {
        (Some(total), Ok(style)) if total > 0 => {
            let pb = ProgressBar::new(total);
            pb.set_style(style.progress_chars("=>-"));
            pb
        }
        _ => {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.green} downloading model") {
                pb.set_style(style);
            }
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        }
    }
}
