//! V4L2 控制 ID 与传感器参数之间的翻译
//!
//! 静态映射表 + 描述重写；不在表中的控制一律 `NotSupported`。

use bytemuck::Zeroable;

use embvid_core::error::{Result, VideoError};
use embvid_core::param::{ParamDesc, ParamId};

use crate::device::VideoDevice;
use crate::uapi::*;

/// (V4L2 CID, 参数 ID, 控制名)
static CID_MAP: [(u32, ParamId, &str); 13] = [
    (V4L2_CID_JPEG_COMPRESSION_QUALITY, ParamId::JpegQuality, "Compression Quality"),
    (V4L2_CID_3A_LOCK, ParamId::Lock3A, "3A Lock"),
    (V4L2_CID_FLASH_LED_MODE, ParamId::FlashLed, "LED Mode"),
    (V4L2_CID_VFLIP, ParamId::VFlip, "Vertical Flip"),
    (V4L2_CID_HFLIP, ParamId::HMirror, "Horizontal Flip"),
    (V4L2_CID_BRIGHTNESS, ParamId::Brightness, "Brightness"),
    (V4L2_CID_CONTRAST, ParamId::Contrast, "Contrast"),
    (V4L2_CID_SATURATION, ParamId::Saturation, "Saturation"),
    (V4L2_CID_COLORFX, ParamId::SpecialEffect, "Color Effects"),
    (V4L2_CID_AUTO_N_PRESET_WHITE_BALANCE, ParamId::WhiteBalance, "White Balance, Auto & Preset"),
    (V4L2_CID_POWER_LINE_FREQUENCY, ParamId::AntiBanding, "Power Line Frequency"),
    (V4L2_CID_AUTO_EXPOSURE_BIAS, ParamId::AeTarget, "Exposure, Bias"),
    (V4L2_CID_TEST_PATTERN, ParamId::TestPattern, "Test Pattern"),
];

pub fn param_for_cid(cid: u32) -> Result<ParamId> {
    CID_MAP
        .iter()
        .find(|(id, _, _)| *id == cid)
        .map(|(_, param, _)| *param)
        .ok_or_else(|| VideoError::not_supported(format!("control {cid:#010x} has no sensor parameter")))
}

pub fn cid_for_param(param: ParamId) -> Option<u32> {
    CID_MAP.iter().find(|(_, p, _)| *p == param).map(|(cid, _, _)| *cid)
}

fn control_name(cid: u32) -> &'static str {
    CID_MAP
        .iter()
        .find(|(id, _, _)| *id == cid)
        .map_or("", |(_, _, name)| *name)
}

/// 把参数描述改写成 QUERY_EXT_CTRL 的回复
pub fn describe(cid: u32, desc: &ParamDesc) -> V4l2QueryExtCtrl {
    let mut q = V4l2QueryExtCtrl::zeroed();
    q.id = cid;
    copy_cstr(&mut q.name, control_name(cid));

    match desc {
        ParamDesc::Number { min, max, step, default } => {
            q.type_ = V4L2_CTRL_TYPE_INTEGER;
            q.minimum = *min as i64;
            q.maximum = *max as i64;
            q.step = *step as u64;
            q.default_value = *default as i64;
            q.elem_size = 4;
            q.elems = 1;
        }
        ParamDesc::Enumeration { elements, default } => {
            // 菜单项就是元素下标，实际值经 QUERYMENU 读出；dims 只带出前几个
            q.type_ = V4L2_CTRL_TYPE_MENU;
            q.minimum = 0;
            q.maximum = elements.len().saturating_sub(1) as i64;
            q.step = 1;
            q.default_value = *default as i64;
            q.elem_size = 4;
            q.elems = elements.len() as u32;
            let dims = elements.len().min(V4L2_CTRL_MAX_DIMS);
            q.nr_of_dims = dims as u32;
            for (slot, value) in q.dims.iter_mut().zip(elements.iter()) {
                *slot = *value as u32;
            }
        }
        ParamDesc::Bitmask { valid_bits, default } => {
            q.type_ = V4L2_CTRL_TYPE_BITMASK;
            q.minimum = 0;
            q.maximum = *valid_bits as i64;
            q.step = 1;
            q.default_value = *default as i64;
            q.elem_size = 4;
            q.elems = 1;
        }
    }
    q
}

/// QUERY_EXT_CTRL
pub fn query_ext_ctrl(dev: &VideoDevice, query: &mut V4l2QueryExtCtrl) -> Result<()> {
    let cid = query.id;
    let param = param_for_cid(cid)?;
    let desc = dev.param_desc(param)?;
    *query = describe(cid, &desc);
    Ok(())
}

/// QUERYMENU：ENUMERATION 参数第 `index` 个元素的实际值
pub fn query_menu(dev: &VideoDevice, menu: &mut V4l2QueryMenu) -> Result<()> {
    let (cid, index) = (menu.id, menu.index);
    let param = param_for_cid(cid)?;
    let ParamDesc::Enumeration { elements, .. } = dev.param_desc(param)? else {
        return Err(VideoError::invalid_arg(format!(
            "{}: control {cid:#010x} is not a menu",
            dev.name()
        )));
    };
    let value = *elements.get(index as usize).ok_or_else(|| {
        VideoError::invalid_arg(format!(
            "{}: menu index {index} of control {cid:#010x} out of range (max {})",
            dev.name(),
            elements.len().saturating_sub(1)
        ))
    })?;

    *menu = V4l2QueryMenu::new(cid, index);
    menu.set_value(value as i64);
    Ok(())
}

/// G_EXT_CTRLS：逐个读取，失败时 `error_idx` 指向出错的控制
pub fn get_ext_ctrls(dev: &VideoDevice, ctrls: &mut [V4l2ExtControl], error_idx: &mut u32) -> Result<()> {
    for (i, ctrl) in ctrls.iter_mut().enumerate() {
        let cid = ctrl.id;
        let value = param_for_cid(cid).and_then(|p| dev.param(p)).map_err(|e| {
            *error_idx = i as u32;
            e
        })?;
        ctrl.set_value(value);
    }
    Ok(())
}

/// S_EXT_CTRLS：逐个校验并写入，遇到第一个错误就停
pub fn set_ext_ctrls(dev: &VideoDevice, ctrls: &[V4l2ExtControl], error_idx: &mut u32) -> Result<()> {
    for (i, ctrl) in ctrls.iter().enumerate() {
        let cid = ctrl.id;
        let value = ctrl.value();
        if let Err(e) = param_for_cid(cid).and_then(|p| dev.set_param(p, value)) {
            tracing::debug!(target: "embvid::v4l2", "{}: control {:#010x} = {} failed: {}", dev.name(), cid, value, e);
            *error_idx = i as u32;
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_a_bijection() {
        for (cid, param, _) in CID_MAP.iter() {
            assert_eq!(param_for_cid(*cid).unwrap(), *param);
            assert_eq!(cid_for_param(*param), Some(*cid));
        }
        assert_eq!(cid_for_param(ParamId::SensorFps), None);
        assert!(matches!(param_for_cid(0x0098_0911), Err(VideoError::NotSupported(_))));
    }

    #[test]
    fn number_becomes_integer() {
        let q = describe(V4L2_CID_HFLIP, &ParamDesc::switch(false));
        assert_eq!(q.type_, V4L2_CTRL_TYPE_INTEGER);
        assert_eq!((q.minimum, q.maximum, q.step, q.default_value), (0, 1, 1, 0));
        assert_eq!(q.elems, 1);
        assert_eq!(read_cstr(&q.name), "Horizontal Flip");
    }

    #[test]
    fn enumeration_becomes_menu() {
        let desc = ParamDesc::Enumeration {
            elements: vec![0, 1, 2, 6, 9],
            default: 0,
        };
        let q = describe(V4L2_CID_COLORFX, &desc);
        assert_eq!(q.type_, V4L2_CTRL_TYPE_MENU);
        assert_eq!((q.minimum, q.maximum, q.step), (0, 4, 1));
        assert_eq!(q.elems, 5);
        assert_eq!(q.elem_size, 4);
        assert_eq!(q.nr_of_dims, 4);
        assert_eq!(q.dims, [0, 1, 2, 6]);
    }

    #[test]
    fn bitmask_keeps_the_mask() {
        let desc = ParamDesc::Bitmask {
            valid_bits: 0x7,
            default: 0,
        };
        let q = describe(V4L2_CID_3A_LOCK, &desc);
        assert_eq!(q.type_, V4L2_CTRL_TYPE_BITMASK);
        assert_eq!((q.minimum, q.maximum, q.step), (0, 7, 1));
    }
}
