// 该文件是 MRI Lens （脑影） 项目的一部分。
// src/server/views.rs - HTML 页面
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

use std::fmt::Write;

use crate::{pipeline::JobStatus, store::DetectionRecord};

const REFRESH_SECONDS: u32 = 2;

const STYLE: &str = r#"
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    font-family: 'Segoe UI', Tahoma, Geneva, Verdana, sans-serif;
    background: linear-gradient(135deg, #667eea 0%, #764ba2 100%);
    min-height: 100vh; padding: 20px;
    display: flex; align-items: center; justify-content: center;
  }
  .container {
    background: rgba(255, 255, 255, 0.95); border-radius: 20px;
    padding: 40px; box-shadow: 0 20px 40px rgba(0,0,0,0.1);
    text-align: center; max-width: 1000px; width: 95%;
  }
  h1 { color: #2c3e50; margin-bottom: 30px; font-size: 2.2em; }
  .upload-area {
    border: 3px dashed #667eea; border-radius: 15px;
    padding: 40px 20px; margin: 30px 0;
  }
  .btn {
    display: inline-block; padding: 15px 30px; border: none; border-radius: 25px;
    font-size: 1.1em; font-weight: 600; color: white; text-decoration: none;
    background: linear-gradient(45deg, #667eea, #764ba2); cursor: pointer; margin: 10px;
  }
  .result-image { max-width: 100%; height: auto; border-radius: 15px; margin: 30px 0; }
  .notice { color: #667eea; font-weight: 600; margin: 30px 0; }
  .error { color: #c0392b; font-weight: 600; margin: 30px 0; white-space: pre-wrap; }
  table { margin: 0 auto 20px; border-collapse: collapse; }
  td, th { padding: 6px 14px; border-bottom: 1px solid #ddd; }
"#;

/// 转义后可安全放入 HTML 文本与带引号的属性
pub fn escape_html(text: &str) -> String {
  let mut escaped = String::with_capacity(text.len());
  for c in text.chars() {
    match c {
      '&' => escaped.push_str("&amp;"),
      '<' => escaped.push_str("&lt;"),
      '>' => escaped.push_str("&gt;"),
      '"' => escaped.push_str("&quot;"),
      '\'' => escaped.push_str("&#39;"),
      _ => escaped.push(c),
    }
  }
  escaped
}

fn layout(title: &str, head_extra: &str, body: &str) -> String {
  format!(
    r#"<!doctype html>
<html lang="en">
<head>
  <title>{title}</title>
  <meta charset="UTF-8">
  <meta name="viewport" content="width=device-width, initial-scale=1.0">
  {head_extra}
  <style>{STYLE}</style>
</head>
<body>
  <div class="container">
{body}
  </div>
</body>
</html>
"#
  )
}

pub fn index_page() -> String {
  layout(
    "Brain Tumor MRI Detection",
    "",
    r#"    <h1>Brain Tumor MRI Detection</h1>
    <form method="post" enctype="multipart/form-data">
      <div class="upload-area">
        <p>Upload MRI Scan for Detection</p>
        <input type="file" name="file" accept="image/*">
      </div>
      <button type="submit" class="btn">Analyze MRI Scan</button>
    </form>"#,
  )
}

pub fn result_page(key: &str, status: &JobStatus, record: Option<&DetectionRecord>) -> String {
  let image_src = escape_html(&format!("/static/results/{}", urlencoding::encode(key)));
  let mut body = String::from("    <h1>Detection Results</h1>\n");
  let mut head_extra = String::new();

  match status {
    JobStatus::Queued | JobStatus::Processing => {
      head_extra = format!(r#"<meta http-equiv="refresh" content="{REFRESH_SECONDS}">"#);
      let _ = writeln!(
        body,
        r#"    <p class="notice">Processing your image ({})...</p>"#,
        status.state_name()
      );
    }
    JobStatus::Failed { error } => {
      let _ = writeln!(
        body,
        r#"    <p class="error">Detection failed: {}</p>"#,
        escape_html(error)
      );
    }
    JobStatus::Succeeded { .. } | JobStatus::Unknown => {
      let _ = writeln!(
        body,
        r#"    <img src="{image_src}" alt="Brain Tumor Detection Results" class="result-image">"#
      );
      if let Some(record) = record {
        body.push_str(&detections_table(record));
      }
    }
  }

  let _ = writeln!(
    body,
    r#"    <a href="/" class="btn">Analyze Another Scan</a>"#
  );
  if !matches!(status, JobStatus::Queued | JobStatus::Processing | JobStatus::Failed { .. }) {
    let _ = writeln!(
      body,
      r#"    <a href="{image_src}" download class="btn">Download Result</a>"#
    );
  }

  layout("Detection Results | Brain Tumor MRI", &head_extra, &body)
}

fn detections_table(record: &DetectionRecord) -> String {
  if record.detections.is_empty() {
    return "    <p class=\"notice\">No findings detected.</p>\n".to_string();
  }

  let mut table = String::from("    <table>\n      <tr><th>Finding</th><th>Confidence</th></tr>\n");
  for detection in &record.detections {
    let _ = writeln!(
      table,
      "      <tr><td>{}</td><td>{:.1}%</td></tr>",
      escape_html(&detection.label),
      detection.score * 100.0
    );
  }
  table.push_str("    </table>\n");
  table
}
