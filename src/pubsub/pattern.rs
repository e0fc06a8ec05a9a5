//! Сопоставление топиков с шаблонами подписок.
//!
//! Топик - непустая строка из сегментов, разделённых `.`. Шаблон
//! дополнительно допускает два wildcard-сегмента:
//! - `*` совпадает ровно с одним сегментом;
//! - `**` совпадает с нулём или более сегментов и допустим только последним.
//!
//! Сопоставление линейно по числу сегментов, без backtracking.

use std::fmt;

use courier_error::{PublishError, SubscribeError};

pub const SEGMENT_SEPARATOR: char = '.';
pub const SINGLE_WILDCARD: &str = "*";
pub const REST_WILDCARD: &str = "**";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(Box<str>),
    Single,
    Rest,
}

/// Разобранный и провалидированный шаблон подписки.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    raw: Box<str>,
    segments: Vec<Segment>,
}

////////////////////////////////////////////////////////////////////////////////
// Собственные методы
////////////////////////////////////////////////////////////////////////////////

impl TopicPattern {
    /// Разбирает шаблон. Отклоняет пустой шаблон, пустые сегменты, `**` не
    /// в конце и сегменты, смешивающие `*` с литералом (`ord*`).
    pub fn parse(pattern: &str) -> Result<Self, SubscribeError> {
        let invalid = |reason: &str| SubscribeError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        let parts: Vec<&str> = pattern.split(SEGMENT_SEPARATOR).collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());

        for (idx, part) in parts.into_iter().enumerate() {
            let segment = match part {
                "" => return Err(invalid("empty segment")),
                SINGLE_WILDCARD => Segment::Single,
                REST_WILDCARD if idx == last => Segment::Rest,
                REST_WILDCARD => return Err(invalid("`**` is only allowed as the last segment")),
                lit if lit.contains('*') => {
                    return Err(invalid("wildcards must occupy a whole segment"))
                }
                lit => Segment::Literal(lit.into()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: pattern.into(),
            segments,
        })
    }

    /// Исходная строка шаблона.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `true`, если в шаблоне нет wildcard-сегментов.
    pub fn is_exact(&self) -> bool {
        self.segments
            .iter()
            .all(|s| matches!(s, Segment::Literal(_)))
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Проверяет, совпадает ли уже провалидированный топик с шаблоном.
    pub fn matches(
        &self,
        topic: &str,
    ) -> bool {
        if topic.is_empty() {
            return false;
        }

        let mut topic_segments = topic.split(SEGMENT_SEPARATOR);
        for segment in &self.segments {
            match segment {
                Segment::Rest => return true,
                Segment::Single => {
                    if topic_segments.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(lit) => match topic_segments.next() {
                    Some(t) if t == &**lit => {}
                    _ => return false,
                },
            }
        }
        topic_segments.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for TopicPattern {
    type Err = SubscribeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Сопоставляет сырую строку шаблона с топиком без предварительного
/// разбора.
///
/// Пустой шаблон совпадает только с пустым топиком и наоборот.
pub fn matches(
    pattern: &str,
    topic: &str,
) -> bool {
    if pattern.is_empty() || topic.is_empty() {
        return pattern == topic;
    }

    let mut topic_segments = topic.split(SEGMENT_SEPARATOR);
    let mut pattern_segments = pattern.split(SEGMENT_SEPARATOR).peekable();

    while let Some(p) = pattern_segments.next() {
        if p == REST_WILDCARD && pattern_segments.peek().is_none() {
            return true;
        }
        match topic_segments.next() {
            Some(t) if p == SINGLE_WILDCARD || p == t => {}
            _ => return false,
        }
    }
    topic_segments.next().is_none()
}

/// Валидирует топик публикации: непустой, без пустых сегментов и без
/// wildcard-символов.
pub fn validate_topic(topic: &str) -> Result<(), PublishError> {
    let invalid = |reason: &str| PublishError::InvalidTopic {
        topic: topic.to_string(),
        reason: reason.to_string(),
    };

    if topic.is_empty() {
        return Err(invalid("topic is empty"));
    }
    for segment in topic.split(SEGMENT_SEPARATOR) {
        if segment.is_empty() {
            return Err(invalid("empty segment"));
        }
        if segment.contains('*') {
            return Err(invalid("wildcards are not allowed in topics"));
        }
    }
    Ok(())
}

////////////////////////////////////////////////////////////////////////////////
// Тесты
////////////////////////////////////////////////////////////////////////////////
