// 该文件是 MRI Lens （脑影） 项目的一部分。
// src/output/save_image_file.rs - 保存标注后的图像文件
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::LetterboxFrame,
  model::DetectResult,
  output::{OverlayResolution, Render, draw::Draw},
};

pub struct SaveImageFileOutput {
  path: PathBuf,
  draw: Arc<Draw>,
  resolution: OverlayResolution,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("无法从扩展名推断图像格式: {0}")]
  UnknownFormat(PathBuf),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(Self::new(
      uri.path(),
      Arc::new(Draw::default()),
      OverlayResolution::default(),
    ))
  }
}

impl SaveImageFileOutput {
  pub fn new(path: impl AsRef<Path>, draw: Arc<Draw>, resolution: OverlayResolution) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
      draw,
      resolution,
    }
  }

  pub fn with_draw(mut self, draw: Arc<Draw>) -> Self {
    self.draw = draw;
    self
  }

  pub fn with_resolution(mut self, resolution: OverlayResolution) -> Self {
    self.resolution = resolution;
    self
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// 先写入同目录临时文件再改名，读者看不到写了一半的图像；
  /// 临时文件名各不相同，并发写同一路径时互不破坏
  fn save_image(&self, image: &RgbImage) -> Result<(), SaveImageFileError> {
    let format = ImageFormat::from_path(&self.path)
      .map_err(|_| SaveImageFileError::UnknownFormat(self.path.clone()))?;

    let parent = match self.path.parent() {
      Some(parent) if !parent.as_os_str().is_empty() => parent,
      _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let file_name = self
      .path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_default();
    let partial = parent.join(format!(".{file_name}.{}.partial", uuid::Uuid::now_v7()));

    if let Err(e) = image.save_with_format(&partial, format) {
      let _ = std::fs::remove_file(&partial);
      return Err(e.into());
    }
    std::fs::rename(&partial, &self.path)?;

    info!("保存图像到文件: {}", self.path.display());

    Ok(())
  }
}

impl<const S: u32> Render<LetterboxFrame<S>, DetectResult> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(
    &self,
    frame: &LetterboxFrame<S>,
    result: &DetectResult,
  ) -> Result<(), Self::Error> {
    let image = self.draw.draw_detection(frame, result, self.resolution);
    self.save_image(&image)
  }
}
