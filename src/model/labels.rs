// 该文件是 MRI Lens （脑影） 项目的一部分。
// src/model/labels.rs - 类别名称
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

use std::{borrow::Cow, sync::Arc};

/// 类别 id 到名称的映射，缺失的 id 显示为 `class_<id>`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Labels {
  names: Arc<[String]>,
}

impl Labels {
  pub fn new(names: Vec<String>) -> Self {
    Self {
      names: names.into(),
    }
  }

  /// 逗号分隔的名称列表，例如 `glioma,meningioma,pituitary`
  pub fn from_csv(list: &str) -> Self {
    Self::new(
      list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect(),
    )
  }

  /// 解析 Ultralytics 导出时写入的 `names` 元数据，
  /// 形如 `{0: 'glioma', 1: 'meningioma'}`
  pub fn parse_ultralytics(meta: &str) -> Option<Self> {
    let body = meta.trim().strip_prefix('{')?.strip_suffix('}')?;
    let mut chars = body.chars().peekable();
    let mut entries: Vec<(usize, String)> = Vec::new();

    loop {
      while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
        chars.next();
      }
      if chars.peek().is_none() {
        break;
      }

      let mut id = String::new();
      while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
        id.push(c);
        chars.next();
      }
      let id: usize = id.parse().ok()?;

      while chars.peek().is_some_and(|c| c.is_whitespace()) {
        chars.next();
      }
      if chars.next()? != ':' {
        return None;
      }
      while chars.peek().is_some_and(|c| c.is_whitespace()) {
        chars.next();
      }

      let quote = chars.next().filter(|c| *c == '\'' || *c == '"')?;
      let mut name = String::new();
      loop {
        match chars.next()? {
          '\\' => name.push(chars.next()?),
          c if c == quote => break,
          c => name.push(c),
        }
      }
      entries.push((id, name));
    }

    if entries.is_empty() {
      return None;
    }

    entries.sort_by_key(|(id, _)| *id);
    let len = entries.last().map(|(id, _)| id + 1).unwrap_or(0);
    let mut names = vec![String::new(); len];
    for (id, name) in entries {
      names[id] = name;
    }
    Some(Self::new(names))
  }

  pub fn name(&self, class_id: u32) -> Cow<'_, str> {
    match self.names.get(class_id as usize) {
      Some(name) if !name.is_empty() => Cow::Borrowed(name.as_str()),
      _ => Cow::Owned(format!("class_{class_id}")),
    }
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}
