use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};
use snafu::prelude::*;
use std::{
    fmt::Display,
    io::{BufRead, BufReader, Read},
    str::FromStr,
};

use super::{
    state::{self, parse_timestamp},
    ChangeDecoder,
};
use crate::{
    osm_data::{
        Change, ChangeKind, Coordinate, Entity, EntityKind, Info, Member, Node, Relation,
        ReplicationState, Tags, Way,
    },
    Error, Result, XmlSnafu,
};

const BUFFER_SIZE: usize = 4096;

// <osmChange version="0.6" generator="...">
//   <modify>
//     <way id="10" version="2" timestamp="2021-01-01T00:00:00Z" changeset="1" uid="1" user="u">
//       <nd ref="1"/>
//       <tag k="highway" v="residential"/>
//     </way>
//   </modify>
// </osmChange>

/// osmChange XML diffs and the `key=value` state files next to them.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsmChangeXml;

impl ChangeDecoder for OsmChangeXml {
    fn decode_changes(
        &self,
        reader: Box<dyn Read + Send>,
    ) -> Result<Box<dyn Iterator<Item = Result<Change>>>> {
        Ok(Box::new(ChangeReader::new(BufReader::new(reader))))
    }

    fn decode_state(&self, reader: Box<dyn Read + Send>) -> Result<ReplicationState> {
        state::parse_state(reader)
    }
}

/// Streams one `<create>`, `<modify>` or `<delete>` section at a time.
pub struct ChangeReader<R> {
    parser: Reader<R>,
    buffer: Vec<u8>,
    finished: bool,
}

impl<R: BufRead> ChangeReader<R> {
    pub fn new(input: R) -> Self {
        let mut parser = Reader::from_reader(input);
        parser.trim_text(true);
        ChangeReader {
            parser,
            buffer: Vec::with_capacity(BUFFER_SIZE),
            finished: false,
        }
    }

    fn read_change(&mut self) -> Result<Option<Change>> {
        loop {
            self.buffer.clear();
            let (kind, is_empty) = match self
                .parser
                .read_event_into(&mut self.buffer)
                .context(XmlSnafu)?
            {
                Event::Start(ref e) => match change_kind(e.name().as_ref()) {
                    Some(kind) => (kind, false),
                    None if e.name().as_ref() == b"osmChange" => continue,
                    None => return Err(unexpected("start element", e.name().as_ref())),
                },
                Event::Empty(ref e) => match change_kind(e.name().as_ref()) {
                    Some(kind) => (kind, true),
                    None if e.name().as_ref() == b"osmChange" => continue,
                    None => return Err(unexpected("empty element", e.name().as_ref())),
                },
                Event::End(ref e) if e.name().as_ref() == b"osmChange" => continue,
                Event::End(ref e) => return Err(unexpected("end element", e.name().as_ref())),
                Event::Eof => return Ok(None),
                _ => continue, // declaration, comments, text
            };
            let entities = if is_empty {
                Vec::new()
            } else {
                self.read_entities(kind)?
            };
            return Ok(Some(Change { kind, entities }));
        }
    }

    fn read_entities(&mut self, kind: ChangeKind) -> Result<Vec<Entity>> {
        let mut entities = Vec::new();
        let mut buffer: Vec<u8> = Vec::with_capacity(BUFFER_SIZE);
        loop {
            buffer.clear();
            match self.parser.read_event_into(&mut buffer).context(XmlSnafu)? {
                Event::Start(ref e) => {
                    let (entity_kind, attributes) = read_start(e)?;
                    let children = self.read_children(e.name().as_ref())?;
                    entities.push(build_entity(entity_kind, attributes, children)?);
                }
                Event::Empty(ref e) => {
                    let (entity_kind, attributes) = read_start(e)?;
                    entities.push(build_entity(entity_kind, attributes, Children::default())?);
                }
                Event::End(ref e) if change_kind(e.name().as_ref()) == Some(kind) => {
                    return Ok(entities)
                }
                Event::End(ref e) => return Err(unexpected("end element", e.name().as_ref())),
                Event::Eof => return Err(Error::decode(format!("<{kind}> is never closed"))),
                _ => continue,
            }
        }
    }

    /// Tags, node refs and members up to the closing tag named `end`.
    fn read_children(&mut self, end: &[u8]) -> Result<Children> {
        let mut children = Children::default();
        let mut buffer: Vec<u8> = Vec::with_capacity(BUFFER_SIZE / 4);
        loop {
            buffer.clear();
            match self.parser.read_event_into(&mut buffer).context(XmlSnafu)? {
                Event::Start(ref e) | Event::Empty(ref e) => children.read_child(e)?,
                Event::End(ref e) if e.name().as_ref() == end => return Ok(children),
                Event::End(_) => continue, // closing a child
                Event::Eof => {
                    return Err(Error::decode(format!(
                        "<{}> is never closed",
                        String::from_utf8_lossy(end)
                    )))
                }
                _ => continue,
            }
        }
    }
}

impl<R: BufRead> Iterator for ChangeReader<R> {
    type Item = Result<Change>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_change() {
            Ok(Some(change)) => Some(Ok(change)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

fn change_kind(name: &[u8]) -> Option<ChangeKind> {
    match name {
        b"create" => Some(ChangeKind::Create),
        b"modify" => Some(ChangeKind::Modify),
        b"delete" => Some(ChangeKind::Delete),
        _ => None,
    }
}

fn unexpected(what: &str, name: &[u8]) -> Error {
    Error::decode(format!(
        "unexpected {what} <{}> in osmChange",
        String::from_utf8_lossy(name)
    ))
}

#[derive(Default)]
struct Attributes {
    id: Option<i64>,
    info: Info,
    lon: Option<f64>,
    lat: Option<f64>,
}

#[derive(Default)]
struct Children {
    tags: Tags,
    refs: Vec<i64>,
    members: Vec<Member>,
}

impl Children {
    fn read_child(&mut self, e: &BytesStart<'_>) -> Result<()> {
        match e.name().as_ref() {
            b"tag" => {
                let mut key = None;
                let mut value = None;
                for_each_attribute(e, |name, v| {
                    match name {
                        b"k" => key = Some(v.to_string()),
                        b"v" => value = Some(v.to_string()),
                        _ => (),
                    }
                    Ok(())
                })?;
                let key = key.ok_or_else(|| Error::decode("tag has no key"))?;
                self.tags.insert(key, value.unwrap_or_default());
            }
            b"nd" => {
                let mut reference = None;
                for_each_attribute(e, |name, v| {
                    if name == b"ref" {
                        reference = Some(parse("ref", v)?);
                    }
                    Ok(())
                })?;
                self.refs
                    .push(reference.ok_or_else(|| Error::decode("nd has no ref"))?);
            }
            b"member" => {
                let mut member_type = None;
                let mut reference = None;
                let mut role = String::new();
                for_each_attribute(e, |name, v| {
                    match name {
                        b"type" => member_type = Some(entity_kind(v.as_bytes())?),
                        b"ref" => reference = Some(parse("ref", v)?),
                        b"role" => role = v.to_string(),
                        _ => (),
                    }
                    Ok(())
                })?;
                self.members.push(Member {
                    member_type: member_type.ok_or_else(|| Error::decode("member has no type"))?,
                    reference: reference.ok_or_else(|| Error::decode("member has no ref"))?,
                    role,
                });
            }
            other => return Err(unexpected("child element", other)),
        }
        Ok(())
    }
}

fn entity_kind(name: &[u8]) -> Result<EntityKind> {
    match name {
        b"node" => Ok(EntityKind::Node),
        b"way" => Ok(EntityKind::Way),
        b"relation" => Ok(EntityKind::Relation),
        other => Err(unexpected("entity", other)),
    }
}

fn read_start(e: &BytesStart<'_>) -> Result<(EntityKind, Attributes)> {
    let kind = entity_kind(e.name().as_ref())?;
    let mut attributes = Attributes::default();
    for_each_attribute(e, |name, value| {
        match name {
            b"id" => attributes.id = Some(parse("id", value)?),
            b"lat" => attributes.lat = Some(parse("lat", value)?),
            b"lon" => attributes.lon = Some(parse("lon", value)?),
            b"version" => attributes.info.version = parse("version", value)?,
            b"changeset" => attributes.info.changeset = parse("changeset", value)?,
            b"uid" => attributes.info.user_id = parse("uid", value)?,
            b"user" => attributes.info.user_name = value.to_string(),
            b"timestamp" => attributes.info.timestamp = Some(parse_timestamp(value)?),
            _ => (), // visible etc.
        }
        Ok(())
    })?;
    Ok((kind, attributes))
}

fn build_entity(kind: EntityKind, attributes: Attributes, children: Children) -> Result<Entity> {
    let id = attributes
        .id
        .ok_or_else(|| Error::decode(format!("{kind} without id")))?;
    let entity = match kind {
        EntityKind::Node => Entity::Node(Node {
            id,
            info: attributes.info,
            tags: children.tags,
            coordinate: attributes
                .lon
                .zip(attributes.lat)
                .map(|(lon, lat)| Coordinate::new(lon, lat)),
            geometry: None,
        }),
        EntityKind::Way => Entity::Way(Way {
            id,
            info: attributes.info,
            tags: children.tags,
            refs: children.refs,
            geometry: None,
        }),
        EntityKind::Relation => Entity::Relation(Relation {
            id,
            info: attributes.info,
            tags: children.tags,
            members: children.members,
            geometry: None,
        }),
    };
    Ok(entity)
}

fn for_each_attribute<F>(e: &BytesStart<'_>, mut f: F) -> Result<()>
where
    F: FnMut(&[u8], &str) -> Result<()>,
{
    for attribute in e.attributes() {
        let attribute = attribute
            .map_err(quick_xml::Error::from)
            .context(XmlSnafu)?;
        let value = attribute.unescape_value().context(XmlSnafu)?;
        f(attribute.key.as_ref(), &value)?;
    }
    Ok(())
}

fn parse<T>(name: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|e| Error::decode(format!("invalid {name} '{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::io::Cursor;

    const DIFF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osmChange version="0.6" generator="test">
  <create>
    <node id="1" version="1" timestamp="2021-01-02T03:04:05Z" changeset="7" uid="3" user="a&amp;b" lat="51.5195553" lon="-0.0362329">
      <tag k="seamark:type" v="gate"/>
    </node>
    <node id="2" version="1" lat="1.0" lon="2.0"/>
  </create>
  <modify>
    <way id="10" version="2">
      <nd ref="1"/>
      <nd ref="2"/>
      <tag k="highway" v="residential"/>
    </way>
    <relation id="20" version="3">
      <member type="way" ref="10" role="outer"/>
      <member type="relation" ref="21" role=""/>
      <tag k="type" v="multipolygon"/>
    </relation>
  </modify>
  <delete>
    <node id="3" version="4"/>
  </delete>
  <delete/>
</osmChange>
"#;

    fn changes(xml: &str) -> Vec<Result<Change>> {
        OsmChangeXml
            .decode_changes(Box::new(Cursor::new(xml.as_bytes().to_vec())))
            .expect("decoder")
            .collect()
    }

    #[test]
    fn reads_changes_in_file_order() {
        let changes: Vec<Change> = changes(DIFF)
            .into_iter()
            .collect::<Result<_>>()
            .expect("valid diff");
        let kinds: Vec<ChangeKind> = changes.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChangeKind::Create,
                ChangeKind::Modify,
                ChangeKind::Delete,
                ChangeKind::Delete
            ]
        );

        match &changes[0].entities[0] {
            Entity::Node(node) => {
                assert_eq!(node.id, 1);
                assert_eq!(node.coordinate, Some(Coordinate::new(-0.0362329, 51.5195553)));
                assert_eq!(node.info.user_name, "a&b");
                assert_eq!(node.info.changeset, 7);
                assert_eq!(
                    node.info.timestamp,
                    Some(Utc.with_ymd_and_hms(2021, 1, 2, 3, 4, 5).unwrap())
                );
                assert_eq!(node.tags.get("seamark:type").map(String::as_str), Some("gate"));
            }
            other => panic!("Expected a node, got {other:?}"),
        }
        assert_eq!(changes[0].entities.len(), 2);

        match &changes[1].entities[..] {
            [Entity::Way(way), Entity::Relation(relation)] => {
                assert_eq!(way.refs, vec![1, 2]);
                assert_eq!(relation.members.len(), 2);
                assert_eq!(relation.members[0].member_type, EntityKind::Way);
                assert_eq!(relation.members[0].role, "outer");
                assert_eq!(relation.members[1].member_type, EntityKind::Relation);
                assert!(relation.has_tag("type", "multipolygon"));
            }
            other => panic!("Unexpected modifications {other:?}"),
        }

        match &changes[2].entities[..] {
            [Entity::Node(node)] => {
                assert_eq!(node.id, 3);
                assert_eq!(node.coordinate, None);
            }
            other => panic!("Unexpected deletions {other:?}"),
        }
        assert!(changes[3].entities.is_empty());
    }

    #[test]
    fn malformed_diffs_end_with_an_error() {
        let results = changes(
            r#"<osmChange><create><node id="x" lat="1" lon="2"/></create><modify/></osmChange>"#,
        );
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(Error::Decode { .. })));

        let results = changes(r#"<osmChange><modify><way id="1"><nd ref="1"/>"#);
        assert!(matches!(results.last(), Some(Err(_))));
    }

    #[test]
    fn empty_documents_have_no_changes() {
        assert!(changes("").is_empty());
        assert!(changes(r#"<osmChange version="0.6"/>"#).is_empty());
    }
}
