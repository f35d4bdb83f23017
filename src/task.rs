// 该文件是 Feiyan （肺炎筛查） 项目的一部分。
// src/task.rs - 任务调度
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

use std::sync::mpsc::{self, Receiver};
use std::{thread, time::Duration};
use tracing::{error, info, warn};

use crate::{model::Model, output::Render};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

/// 只诊断第一张图像
pub struct OneShotTask;

impl<
  F,
  D,
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  M: Model<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
> Task<I, M, O> for OneShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let image = input.next().ok_or_else(|| anyhow::anyhow!("没有输入图像"))?;
    info!("输入图像获取成功，开始诊断...");
    let now = std::time::Instant::now();
    let result = model.infer(&image)?;
    let elapsed = now.elapsed();
    info!("诊断完成，耗时: {:.2?}", elapsed);
    output.render_result(&image, &result)?;
    info!("输出完成，耗时: {:.2?}", now.elapsed());

    Ok(())
  }
}

/// 预热轮次，不计入平均耗时
const WARMUP_RUNS: usize = 2;

/// 对同一张图像重复诊断，统计平均耗时
#[derive(Debug, Clone, Copy)]
pub struct RepeatShotTask {
  repeat: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self { repeat: 100 }
  }
}

impl RepeatShotTask {
  /// 次数至少为预热轮次加一
  pub fn with_repeat(mut self, repeat: usize) -> Self {
    self.repeat = repeat.max(WARMUP_RUNS + 1);
    self
  }

  pub fn repeat(&self) -> usize {
    self.repeat
  }
}

/// 去掉预热轮次后的平均值
pub fn average_after_warmup(times: &[Duration]) -> Option<Duration> {
  let measured = times.get(WARMUP_RUNS..)?;
  if measured.is_empty() {
    return None;
  }
  Some(measured.iter().sum::<Duration>() / measured.len() as u32)
}

impl<
  F,
  D,
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  M: Model<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
> Task<I, M, O> for RepeatShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let image = input.next().ok_or_else(|| anyhow::anyhow!("没有输入图像"))?;
    info!("输入图像获取成功，开始诊断...");
    let mut times = Vec::with_capacity(self.repeat);
    for i in 0..self.repeat {
      let now = std::time::Instant::now();
      let result = model.infer(&image)?;
      let elapsed = now.elapsed();
      info!("({})诊断完成，耗时: {:.2?}", i, elapsed);
      output.render_result(&image, &result)?;
      times.push(elapsed);
    }

    if let Some(average) = average_after_warmup(&times) {
      warn!("平均诊断时间: {:.2?}", average);
    }

    Ok(())
  }
}

/// 逐张诊断输入中的所有图像。
///
/// 单张图像失败只记录日志并跳过，Ctrl-C 在两张图像之间生效。
#[derive(Debug, Clone, Copy)]
pub struct BatchTask {
  limit: Option<usize>,
  interruptible: bool,
}

impl Default for BatchTask {
  fn default() -> Self {
    Self {
      limit: None,
      interruptible: true,
    }
  }
}

/// 批量任务的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
  pub succeeded: usize,
  pub failed: usize,
  pub interrupted: bool,
}

impl BatchTask {
  pub fn with_limit(mut self, limit: Option<usize>) -> Self {
    self.limit = limit;
    self
  }

  /// 关闭时不安装 Ctrl-C 处理函数
  pub fn with_interrupt(mut self, interruptible: bool) -> Self {
    self.interruptible = interruptible;
    self
  }

  fn install_interrupt(&self) -> Option<Receiver<()>> {
    if !self.interruptible {
      return None;
    }
    let (tx, rx) = mpsc::channel();
    let installed = ctrlc::set_handler(move || {
      info!("收到中断信号，处理完当前图像后退出...");
      let _ = tx.send(());
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    });
    match installed {
      Ok(()) => Some(rx),
      Err(e) => {
        warn!("无法安装 Ctrl-C 处理函数, 批量任务不可中断: {}", e);
        None
      }
    }
  }

  /// 执行批量诊断并返回统计
  pub fn run_batch<F, D, ME, RE, I, M, O>(
    self,
    input: I,
    model: M,
    output: O,
  ) -> anyhow::Result<BatchSummary>
  where
    ME: std::error::Error + Sync + Send + 'static,
    RE: std::error::Error + Sync + Send + 'static,
    I: Iterator<Item = F>,
    M: Model<Input = F, Output = D, Error = ME>,
    O: Render<F, D, Error = RE>,
  {
    info!("开始批量任务...");
    let interrupt = self.install_interrupt();
    let mut summary = BatchSummary::default();

    for (index, image) in input.enumerate() {
      if self.limit.is_some_and(|n| index >= n) {
        info!("达到指定数量 {}, 退出任务循环", index);
        break;
      }

      let now = std::time::Instant::now();
      match model.infer(&image) {
        Ok(result) => {
          output.render_result(&image, &result)?;
          summary.succeeded += 1;
          info!("第 {} 张图像完成，耗时: {:.2?}", index + 1, now.elapsed());
        }
        Err(e) => {
          summary.failed += 1;
          error!("第 {} 张图像诊断失败, 已跳过: {}", index + 1, e);
        }
      }

      if interrupt.as_ref().is_some_and(|rx| rx.try_recv().is_ok()) {
        warn!("中断信号接收，退出任务循环");
        summary.interrupted = true;
        break;
      }
    }

    info!(
      "批量任务完成: 成功 {}, 失败 {}",
      summary.succeeded, summary.failed
    );
    Ok(summary)
  }
}

impl<
  F,
  D,
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = F>,
  M: Model<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
> Task<I, M, O> for BatchTask
{
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error> {
    self.run_batch(input, model, output).map(|_| ())
  }
}
