//! XML系ベンダー形式（Qualisys `.qca.txt`、Vicon `.xcp`）の共通処理

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::error::CalibrationError;

/// XML要素（属性のみ、テキストは使わない）
#[derive(Debug, Clone, Default)]
pub(super) struct Element {
    pub name: String,
    pub attrs: HashMap<String, String>,
    pub children: Vec<Element>,
}

impl Element {
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// 属性（大文字小文字を区別しない）
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn require(&self, camera: &str, key: &str) -> Result<&str, CalibrationError> {
        self.attr(key).ok_or_else(|| CalibrationError::MissingField {
            camera: camera.to_string(),
            field: format!("{}@{}", self.name, key),
        })
    }

    pub fn require_f64(&self, camera: &str, key: &str) -> Result<f64, CalibrationError> {
        let raw = self.require(camera, key)?;
        raw.trim().parse().map_err(|_| CalibrationError::InvalidValue {
            camera: camera.to_string(),
            field: format!("{}@{}", self.name, key),
            reason: format!("not a number: {:?}", raw),
        })
    }

    pub fn optional_f64(&self, camera: &str, key: &str) -> Result<Option<f64>, CalibrationError> {
        match self.attr(key) {
            Some(_) => self.require_f64(camera, key).map(Some),
            None => Ok(None),
        }
    }

    /// 空白区切りの数値列
    pub fn require_f64_list(&self, camera: &str, key: &str) -> Result<Vec<f64>, CalibrationError> {
        let raw = self.require(camera, key)?;
        raw.split_whitespace()
            .map(|s| {
                s.parse().map_err(|_| CalibrationError::InvalidValue {
                    camera: camera.to_string(),
                    field: format!("{}@{}", self.name, key),
                    reason: format!("not a number list: {:?}", raw),
                })
            })
            .collect()
    }

    /// 深さ優先で名前が一致する要素を集める
    pub fn descendants_named<'a>(&'a self, name: &str, out: &mut Vec<&'a Element>) {
        for child in &self.children {
            if child.name == name {
                out.push(child);
            } else {
                child.descendants_named(name, out);
            }
        }
    }
}

fn read_attrs(e: &BytesStart) -> Result<Element, CalibrationError> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut attrs = HashMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|err| CalibrationError::Xml(err.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|err| CalibrationError::Xml(err.to_string()))?
            .into_owned();
        attrs.insert(key, value);
    }
    Ok(Element {
        name,
        attrs,
        children: Vec::new(),
    })
}

/// 文書全体を要素ツリーとして読む（仮想ルートの子が最上位要素）
pub(super) fn parse_tree(content: &str) -> Result<Element, CalibrationError> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut stack = vec![Element::default()];
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => stack.push(read_attrs(&e)?),
            Ok(Event::Empty(e)) => {
                let element = read_attrs(&e)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(element);
                }
            }
            Ok(Event::End(_)) => {
                if stack.len() < 2 {
                    return Err(CalibrationError::Xml("unbalanced closing tag".to_string()));
                }
                if let (Some(done), Some(parent)) = (stack.pop(), stack.last_mut()) {
                    parent.children.push(done);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(CalibrationError::Xml(format!(
                    "at byte {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
        }
    }

    if stack.len() != 1 {
        return Err(CalibrationError::Xml("unexpected end of document".to_string()));
    }
    Ok(stack.pop().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tree() {
        let doc = r#"<?xml version="1.0"?>
            <root a="1"><item name="x" value="2.5"/><item name="y"><leaf k="v"/></item></root>"#;
        let tree = parse_tree(doc).unwrap();
        let root = tree.child("root").unwrap();
        assert_eq!(root.attr("A"), Some("1"));
        assert_eq!(root.children_named("item").count(), 2);
        let mut leaves = Vec::new();
        tree.descendants_named("leaf", &mut leaves);
        assert_eq!(leaves.len(), 1);
        assert_eq!(root.children[0].require_f64("c", "value").unwrap(), 2.5);
    }

    #[test]
    fn test_unbalanced() {
        assert!(parse_tree("<a><b></a>").is_err());
        assert!(parse_tree("<a>").is_err());
    }
}
