//! C3D バイナリの書き出し（浮動小数点形式、Intel バイトオーダー）
//!
//! 512バイトのブロック単位: ヘッダ1ブロック、パラメータ、3D点データ。
//! 座標はワールド座標（Z-up）のままミリメートルで書く。欠損は残差ワード -1。

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{ensure, Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};

use crate::pipeline::Reconstruction;
use crate::pose::Skeleton;

const BLOCK: usize = 512;
const KEY: u8 = 0x50;
/// パラメータセクションのプロセッサ種別（Intel）
const PROCESSOR_INTEL: u8 = 84;
/// 負のスケール = 浮動小数点データ
const POINT_SCALE: f32 = -1.0;

#[derive(Clone, Copy)]
enum Group {
    Point = 1,
    Analog = 2,
}

/// パラメータセクションの組み立て
#[derive(Default)]
struct ParameterWriter {
    buf: Vec<u8>,
    /// 直前のレコードの「次レコードへのオフセット」ワード位置
    last_offset: Option<usize>,
}

enum Value<'a> {
    Int(i16),
    Float(f32),
    Text(&'a str),
    Texts(&'a [String]),
}

impl ParameterWriter {
    fn group(&mut self, group: Group, name: &str, description: &str) -> Result<()> {
        self.buf.write_i8(name.len() as i8)?;
        self.buf.write_i8(-(group as i8))?;
        self.buf.extend_from_slice(name.as_bytes());
        self.last_offset = Some(self.buf.len());
        self.buf.write_i16::<LittleEndian>(2 + 1 + description.len() as i16)?;
        self.buf.write_u8(description.len() as u8)?;
        self.buf.extend_from_slice(description.as_bytes());
        Ok(())
    }

    fn param(&mut self, group: Group, name: &str, value: Value) -> Result<()> {
        let mut body = Vec::new();
        match value {
            Value::Int(v) => {
                body.write_i8(2)?;
                body.write_u8(0)?;
                body.write_i16::<LittleEndian>(v)?;
            }
            Value::Float(v) => {
                body.write_i8(4)?;
                body.write_u8(0)?;
                body.write_f32::<LittleEndian>(v)?;
            }
            Value::Text(s) => {
                body.write_i8(-1)?;
                body.write_u8(1)?;
                body.write_u8(s.len() as u8)?;
                body.extend_from_slice(s.as_bytes());
            }
            Value::Texts(items) => {
                let width = items.iter().map(|s| s.len()).max().unwrap_or(0).max(1);
                ensure!(width <= u8::MAX as usize && items.len() <= u8::MAX as usize, "{} too large for C3D", name);
                body.write_i8(-1)?;
                body.write_u8(2)?;
                body.write_u8(width as u8)?;
                body.write_u8(items.len() as u8)?;
                for s in items {
                    body.extend_from_slice(format!("{:<width$}", s, width = width).as_bytes());
                }
            }
        }
        // 説明なし
        body.write_u8(0)?;

        self.buf.write_i8(name.len() as i8)?;
        self.buf.write_i8(group as i8)?;
        self.buf.extend_from_slice(name.as_bytes());
        self.last_offset = Some(self.buf.len());
        self.buf.write_i16::<LittleEndian>(2 + body.len() as i16)?;
        self.buf.extend_from_slice(&body);
        Ok(())
    }

    /// 最後のレコードのオフセットを 0 にしてブロック境界まで埋める
    fn finish(mut self) -> Vec<u8> {
        if let Some(pos) = self.last_offset {
            self.buf[pos] = 0;
            self.buf[pos + 1] = 0;
        }
        let mut out = vec![0x01, KEY, 0, PROCESSOR_INTEL];
        out.extend_from_slice(&self.buf);
        let blocks = out.len().div_ceil(BLOCK);
        out[2] = blocks as u8;
        out.resize(blocks * BLOCK, 0);
        out
    }
}

/// 1人物分を C3D で書き出す
pub fn write_c3d<W: Write>(
    out: &mut W,
    reconstruction: &Reconstruction,
    skeleton: &Skeleton,
    person: usize,
) -> Result<()> {
    let (start, end) = reconstruction.frame_range;
    let frames = end - start;
    ensure!(frames > 0, "nothing to export");
    ensure!(end <= u16::MAX as usize, "frame {} exceeds the C3D header range", end);

    let labels: Vec<String> = skeleton.joints().map(|j| j.name.clone()).collect();
    let trajectories: Vec<_> = skeleton
        .joints()
        .map(|j| reconstruction.trajectory(person, j.id))
        .collect();
    let points = labels.len();
    let rate = reconstruction.frame_rate as f32;

    // パラメータは DATA_START を含むので、先にブロック数を確定させる
    let build = |data_start: i16| -> Result<Vec<u8>> {
        let mut params = ParameterWriter::default();
        params.group(Group::Point, "POINT", "3-D point parameters")?;
        params.param(Group::Point, "USED", Value::Int(points as i16))?;
        params.param(Group::Point, "FRAMES", Value::Int(frames as u16 as i16))?;
        params.param(Group::Point, "DATA_START", Value::Int(data_start))?;
        params.param(Group::Point, "SCALE", Value::Float(POINT_SCALE))?;
        params.param(Group::Point, "RATE", Value::Float(rate))?;
        params.param(Group::Point, "UNITS", Value::Text("mm"))?;
        params.param(Group::Point, "LABELS", Value::Texts(&labels))?;
        params.param(Group::Point, "DESCRIPTIONS", Value::Texts(&labels))?;
        params.group(Group::Analog, "ANALOG", "Analog data parameters")?;
        params.param(Group::Analog, "USED", Value::Int(0))?;
        params.param(Group::Analog, "RATE", Value::Float(rate))?;
        Ok(params.finish())
    };
    let blocks = build(0)?.len() / BLOCK;
    let data_start = 2 + blocks;
    let parameters = build(data_start as i16)?;

    let mut header = Vec::with_capacity(BLOCK);
    header.write_u8(2)?;
    header.write_u8(KEY)?;
    header.write_u16::<LittleEndian>(points as u16)?;
    header.write_u16::<LittleEndian>(0)?;
    header.write_u16::<LittleEndian>(start as u16 + 1)?;
    header.write_u16::<LittleEndian>(end as u16)?;
    header.write_u16::<LittleEndian>(10)?;
    header.write_f32::<LittleEndian>(POINT_SCALE)?;
    header.write_u16::<LittleEndian>(data_start as u16)?;
    header.write_u16::<LittleEndian>(0)?;
    header.write_f32::<LittleEndian>(rate)?;
    header.resize(BLOCK, 0);

    out.write_all(&header)?;
    out.write_all(&parameters)?;

    let mut data = Vec::with_capacity(frames * points * 16);
    for frame in start..end {
        for traj in &trajectories {
            match traj.and_then(|t| t.get(frame)) {
                Some(p) => {
                    for v in p {
                        data.write_f32::<LittleEndian>((v * 1000.0) as f32)?;
                    }
                    data.write_f32::<LittleEndian>(0.0)?;
                }
                None => {
                    for _ in 0..3 {
                        data.write_f32::<LittleEndian>(0.0)?;
                    }
                    data.write_f32::<LittleEndian>(-1.0)?;
                }
            }
        }
    }
    data.resize(data.len().div_ceil(BLOCK) * BLOCK, 0);
    out.write_all(&data)?;
    Ok(())
}

pub fn save_c3d<P: AsRef<Path>>(
    path: P,
    reconstruction: &Reconstruction,
    skeleton: &Skeleton,
    person: usize,
) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut out = BufWriter::new(file);
    write_c3d(&mut out, reconstruction, skeleton, person)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    out.flush()?;
    Ok(())
}
